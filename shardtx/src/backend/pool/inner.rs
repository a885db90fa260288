//! Pool internals synchronized with a mutex.

use std::collections::VecDeque;

use shardtx_stats::PoolCounts;
use tokio::sync::oneshot::Sender;
use tokio::time::Instant;

use crate::backend::Connection;

use super::Config;

/// What a waiter receives.
#[derive(Debug)]
pub(super) enum Grant {
    /// Idle connection handed over directly.
    Conn(Connection),
    /// Permission to open a new connection in a freed slot.
    Slot,
}

/// Caller waiting for a connection.
#[derive(Debug)]
pub(super) struct Waiter {
    pub(super) tx: Sender<Grant>,
    pub(super) since: Instant,
}

/// Pool internals protected by a mutex.
#[derive(Debug)]
pub(super) struct Inner {
    /// Idle connections.
    idle: Vec<Connection>,
    /// Pool configuration.
    pub(super) config: Config,
    /// Connections accounted for, idle or checked out.
    pub(super) active: usize,
    /// Connections checked out.
    pub(super) in_use: usize,
    /// Callers waiting for a connection, oldest first.
    pub(super) waiting: VecDeque<Waiter>,
    /// Pool accepts checkouts.
    pub(super) online: bool,
    /// Counters.
    pub(super) counts: PoolCounts,
}

impl Inner {
    pub(super) fn new(config: Config) -> Self {
        Self {
            idle: Vec::new(),
            config,
            active: 0,
            in_use: 0,
            waiting: VecDeque::new(),
            online: false,
            counts: PoolCounts::default(),
        }
    }

    /// Number of idle connections.
    #[inline]
    pub(super) fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Take an idle connection.
    #[inline]
    pub(super) fn take(&mut self) -> Option<Connection> {
        let conn = self.idle.pop();
        if conn.is_some() {
            self.in_use += 1;
        }
        conn
    }

    /// There is room for another connection.
    #[inline]
    pub(super) fn can_create(&self) -> bool {
        self.active < self.config.capacity
    }

    /// Account for a connection about to be created.
    #[inline]
    pub(super) fn reserve_slot(&mut self) {
        self.active += 1;
        self.in_use += 1;
    }

    /// Forget waiters that gave up.
    pub(super) fn prune_waiters(&mut self) {
        self.waiting.retain(|waiter| !waiter.tx.is_closed());
    }

    /// No more callers may wait.
    pub(super) fn queue_full(&self) -> bool {
        self.config.max_waiters > 0 && self.waiting.len() >= self.config.max_waiters
    }

    /// Hand a grant to the oldest live waiter. Returns it if nobody is waiting.
    fn grant(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiting.pop_front() {
            let slot = matches!(grant, Grant::Slot);
            match waiter.tx.send(grant) {
                Ok(()) => {
                    self.in_use += 1;
                    if slot {
                        self.active += 1;
                    }
                    return None;
                }
                Err(returned) => grant = returned,
            }
        }

        Some(grant)
    }

    /// Give freed slots to waiters.
    fn grant_slots(&mut self) {
        while self.can_create() && self.online {
            if self.grant(Grant::Slot).is_some() {
                break;
            }
        }
    }

    /// Take a connection back. `None` frees the slot without returning anything.
    ///
    /// Counters saturate, so returning more than was taken never underflows.
    pub(super) fn check_in(&mut self, conn: Option<Connection>) {
        self.in_use = self.in_use.saturating_sub(1);

        match conn {
            Some(conn)
                if !conn.is_closed() && self.online && self.active <= self.config.capacity =>
            {
                if let Some(Grant::Conn(conn)) = self.grant(Grant::Conn(conn)) {
                    self.idle.push(conn);
                }
            }

            Some(mut conn) => {
                conn.close();
                self.active = self.active.saturating_sub(1);
                self.grant_slots();
            }

            None => {
                self.active = self.active.saturating_sub(1);
                self.grant_slots();
            }
        }
    }

    /// Close connections that have been idle for too long.
    pub(super) fn close_idle(&mut self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        if idle_timeout.is_zero() {
            return 0;
        }

        let mut removed = 0;
        self.idle.retain_mut(|conn| {
            if conn.idle_for(now) >= idle_timeout {
                conn.close();
                removed += 1;
                false
            } else {
                true
            }
        });

        self.active = self.active.saturating_sub(removed);
        self.counts.idle_closed += removed;

        removed
    }

    /// Change capacity, closing surplus idle connections.
    /// Surplus checked-out connections are closed when they come back.
    pub(super) fn set_capacity(&mut self, capacity: usize) {
        self.config.capacity = capacity;

        while self.active > capacity {
            match self.idle.pop() {
                Some(mut conn) => {
                    conn.close();
                    self.active -= 1;
                }
                None => break,
            }
        }

        self.grant_slots();
    }

    /// Stop accepting checkouts, fail waiters and close idle connections.
    pub(super) fn shutdown(&mut self) {
        self.online = false;
        // Dropping the senders wakes waiters with an error.
        self.waiting.clear();

        let closed = self.idle.len();
        for mut conn in self.idle.drain(..) {
            conn.close();
        }
        self.active = self.active.saturating_sub(closed);
    }
}
