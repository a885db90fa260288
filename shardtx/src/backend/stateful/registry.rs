//! Map of live stateful connections, with lock-on-lookup semantics.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::Local;
use fnv::FnvHashMap;
use lru::LruCache;
use parking_lot::{lock_api::MutexGuard, Mutex, RawMutex};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::util::format_time;

use super::{Error, StatefulConnection};

/// What unlocked connections are allowed to do. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Mode {
    #[default]
    Normal,
    /// Connections outside a transaction are released on unlock.
    NonTxShutdown,
    /// Every connection is closed and released on unlock.
    AllShutdown,
}

#[derive(Debug)]
struct Entry {
    /// `None` while locked by a caller.
    conn: Option<StatefulConnection>,
    purpose: String,
    last_used: Instant,
}

impl Entry {
    fn locked(purpose: &str) -> Self {
        Self {
            conn: None,
            purpose: purpose.to_string(),
            last_used: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    conns: FnvHashMap<i64, Entry>,
    /// Why recently removed ids went away.
    ended: LruCache<i64, String>,
    mode: Mode,
}

#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    size: watch::Sender<usize>,
}

impl Registry {
    pub fn new(ended_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(ended_capacity).unwrap_or(NonZeroUsize::MIN);
        let (size, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                conns: FnvHashMap::default(),
                ended: LruCache::new(capacity),
                mode: Mode::Normal,
            }),
            size,
        }
    }

    /// Add an id, locked by its creator.
    pub fn register(&self, id: i64, purpose: &str) {
        let mut guard = self.lock();
        guard.conns.insert(id, Entry::locked(purpose));
        self.notify(guard.conns.len());
    }

    /// Take the connection out, leaving its entry locked for `purpose`.
    pub fn get_and_lock(&self, id: i64, purpose: &str) -> Result<StatefulConnection, Error> {
        let mut guard = self.lock();
        let Inner { conns, ended, .. } = &mut *guard;

        let Some(entry) = conns.get_mut(&id) else {
            return Err(match ended.get(&id) {
                Some(reason) => Error::lookup(id, reason),
                None => Error::lookup(id, "not found"),
            });
        };

        match entry.conn.take() {
            Some(conn) => {
                entry.purpose = purpose.to_string();
                Ok(conn)
            }
            None => Err(Error::lookup(id, format!("in use: {}", entry.purpose))),
        }
    }

    /// Put a locked connection back. Returns it if its entry is gone.
    pub fn put_back(
        &self,
        conn: StatefulConnection,
        update_time: bool,
    ) -> Result<(), StatefulConnection> {
        let mut guard = self.lock();
        match guard.conns.get_mut(&conn.id()) {
            Some(entry) => {
                if update_time {
                    entry.last_used = Instant::now();
                }
                entry.purpose.clear();
                entry.conn = Some(conn);
                Ok(())
            }
            None => Err(conn),
        }
    }

    /// Forget an id, remembering why.
    pub fn remove(&self, id: i64, reason: &str) {
        let mut guard = self.lock();
        if guard.conns.remove(&id).is_some() {
            let ended = format!("ended at {} ({})", format_time(Local::now()), reason);
            guard.ended.put(id, ended);
            self.notify(guard.conns.len());
        }
    }

    /// Move a locked entry to a new id.
    pub fn rename(&self, old: i64, new: i64, reason: &str) -> Result<(), Error> {
        let mut guard = self.lock();
        let Some(entry) = guard.conns.remove(&old) else {
            return Err(Error::lookup(old, "not found"));
        };
        guard.conns.insert(new, entry);
        let ended = format!("ended at {} ({})", format_time(Local::now()), reason);
        guard.ended.put(old, ended);
        Ok(())
    }

    /// Lock every unlocked connection matching `filter`.
    pub fn take_matching(
        &self,
        purpose: &str,
        filter: impl Fn(&StatefulConnection, Duration) -> bool,
    ) -> Vec<StatefulConnection> {
        let now = Instant::now();
        let mut guard = self.lock();
        let mut taken = vec![];

        for entry in guard.conns.values_mut() {
            let idle = now.saturating_duration_since(entry.last_used);
            if entry.conn.as_ref().is_some_and(|conn| filter(conn, idle)) {
                if let Some(conn) = entry.conn.take() {
                    entry.purpose = purpose.to_string();
                    taken.push(conn);
                }
            }
        }

        taken
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Escalate the shutdown mode. Never moves back towards `Normal`.
    pub fn escalate(&self, mode: Mode) {
        let mut guard = self.lock();
        guard.mode = guard.mode.max(mode);
    }

    /// Accept connections again.
    pub fn reset_mode(&self) {
        self.lock().mode = Mode::Normal;
    }

    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no entries are left.
    pub async fn wait_for_empty(&self) {
        let mut rx = self.size.subscribe();
        // The sender lives as long as self.
        let _ = rx.wait_for(|size| *size == 0).await;
    }

    fn notify(&self, size: usize) {
        self.size.send_replace(size);
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, RawMutex, Inner> {
        self.inner.lock()
    }
}
