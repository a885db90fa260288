//! Connection guard.

use std::ops::{Deref, DerefMut};

use crate::backend::Connection;

use super::Pool;

/// Leased connection, returned to its pool on drop.
pub struct Guard {
    conn: Option<Connection>,
    pool: Option<Pool>,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("conn", &self.conn)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Guard {
    pub(super) fn new(pool: Pool, conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            pool: Some(pool),
        }
    }

    /// Connection that doesn't belong to any pool.
    pub(super) fn unpooled(conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            pool: None,
        }
    }

    /// Detach from the pool, freeing its slot. The connection
    /// is closed instead of returned when this guard drops.
    pub fn taint(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(None);
        }
    }

    /// Connection still counts against its pool.
    pub fn pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Deref for Guard {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match self.pool.take() {
                Some(pool) => pool.put(Some(conn)),
                None => conn.close(),
            }
        }
    }
}

/// Slot counted against the pool while its connection is being opened.
/// Freed on drop unless filled.
pub(super) struct Reserved {
    pool: Option<Pool>,
}

impl Reserved {
    pub(super) fn new(pool: &Pool) -> Self {
        Self {
            pool: Some(pool.clone()),
        }
    }

    pub(super) fn fill(mut self, conn: Connection) -> Guard {
        match self.pool.take() {
            Some(pool) => Guard::new(pool, conn),
            None => Guard::unpooled(conn),
        }
    }
}

impl Drop for Reserved {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(None);
        }
    }
}
