//! Per-caller admission control.
//!
//! Best effort and in memory only: counts are lost on restart.

use fnv::FnvHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::Caller;
use crate::env::Env;

/// Caps how many transactions one caller may hold open.
#[derive(Debug)]
pub enum Limiter {
    /// Limiter disabled.
    AllowAll,
    Counting(Counting),
}

#[derive(Debug)]
pub struct Counting {
    env: Env,
    max: usize,
    dry_run: bool,
    by_username: bool,
    by_host: bool,
    usage: Mutex<FnvHashMap<String, usize>>,
}

impl Limiter {
    pub fn new(env: &Env) -> Self {
        let config = env.config();
        let limiter = &config.tx_limiter;

        if !limiter.enabled {
            return Self::AllowAll;
        }

        let max = (config.tx_pool.size as f64 * limiter.max_per_user).floor() as usize;

        Self::Counting(Counting {
            env: env.clone(),
            max,
            dry_run: limiter.dry_run,
            by_username: limiter.by_username,
            by_host: limiter.by_host,
            usage: Mutex::new(FnvHashMap::default()),
        })
    }

    /// Take a slot for `caller`. Returns false if the caller is at its cap.
    pub fn get(&self, caller: &Caller) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Counting(counting) => counting.get(caller),
        }
    }

    /// Give back a slot taken by [`Limiter::get`].
    pub fn release(&self, caller: &Caller) {
        if let Self::Counting(counting) = self {
            counting.release(caller);
        }
    }

    /// Slots currently held by `caller`.
    pub fn usage(&self, caller: &Caller) -> usize {
        match self {
            Self::AllowAll => 0,
            Self::Counting(counting) => counting
                .usage
                .lock()
                .get(&counting.key(caller))
                .copied()
                .unwrap_or(0),
        }
    }
}

impl Counting {
    /// With both flags off every caller shares the empty key.
    fn key(&self, caller: &Caller) -> String {
        let mut parts = vec![];
        if self.by_host {
            parts.push(caller.host());
        }
        if self.by_username {
            parts.push(caller.username());
        }
        parts.join("/")
    }

    fn get(&self, caller: &Caller) -> bool {
        let key = self.key(caller);
        let mut usage = self.usage.lock();
        let count = usage.entry(key.clone()).or_default();

        if *count < self.max {
            *count += 1;
            return true;
        }

        if self.dry_run {
            debug!("limiter would reject \"{}\" [dry run]", key);
            self.env.stats().limiter_dry_run(&key);
            *count += 1;
            true
        } else {
            debug!("limiter rejected \"{}\", {} of {} in use", key, count, self.max);
            self.env.stats().limiter_rejection(&key);
            false
        }
    }

    fn release(&self, caller: &Caller) {
        let key = self.key(caller);
        let mut usage = self.usage.lock();
        if let Some(count) = usage.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                usage.remove(&key);
            }
        }
    }
}
