//! Holding area for prepared transactions.
//!
//! A prepared transaction keeps its connection locked here until it's
//! committed or rolled back. Capacity is kept below the transaction pool's
//! so there are always connections left to write the redo log.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::backend::StatefulConnection;

use super::Error;

#[derive(Debug)]
struct Inner {
    conns: HashMap<String, StatefulConnection>,
    /// Dtids being committed or whose commit failed.
    reserved: HashMap<String, &'static str>,
    open: bool,
}

/// Prepared transactions by dtid.
#[derive(Debug)]
pub struct PreparedPool {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl PreparedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                reserved: HashMap::new(),
                open: false,
            }),
            capacity,
        }
    }

    pub fn open(&self) {
        self.inner.lock().open = true;
    }

    /// Hold `conn` under `dtid`. The connection is handed back on error.
    pub fn put(
        &self,
        conn: StatefulConnection,
        dtid: &str,
    ) -> Result<(), (StatefulConnection, Error)> {
        let mut guard = self.inner.lock();

        if !guard.open {
            return Err((conn, Error::Shutdown));
        }

        if guard.reserved.contains_key(dtid) || guard.conns.contains_key(dtid) {
            return Err((conn, Error::Duplicate(dtid.to_string())));
        }

        if guard.conns.len() >= self.capacity {
            return Err((conn, Error::ExceededLimit(self.capacity)));
        }

        guard.conns.insert(dtid.to_string(), conn);
        Ok(())
    }

    /// Take a connection out for commit. `None` means there's nothing to commit.
    pub fn fetch_for_commit(&self, dtid: &str) -> Result<Option<StatefulConnection>, Error> {
        let mut guard = self.inner.lock();

        if !guard.open {
            return Err(Error::Shutdown);
        }

        if let Some(state) = guard.reserved.get(dtid) {
            return Err(Error::CommitState {
                dtid: dtid.to_string(),
                state,
            });
        }

        let conn = guard.conns.remove(dtid);
        if conn.is_some() {
            guard.reserved.insert(dtid.to_string(), "committing");
        }

        Ok(conn)
    }

    /// Take a connection out for rollback. Nothing is returned
    /// for dtids being committed or marked failed.
    pub fn fetch_for_rollback(&self, dtid: &str) -> Option<StatefulConnection> {
        let mut guard = self.inner.lock();

        if !guard.open || guard.reserved.contains_key(dtid) {
            return None;
        }

        guard.conns.remove(dtid)
    }

    /// Commit failed. Further commits fail until the dtid is forgotten.
    pub fn set_failed(&self, dtid: &str) {
        self.inner
            .lock()
            .reserved
            .insert(dtid.to_string(), "failed");
    }

    /// Drop the commit reservation for `dtid`.
    pub fn forget(&self, dtid: &str) {
        self.inner.lock().reserved.remove(dtid);
    }

    /// Close the pool and return every held connection.
    pub fn fetch_all_for_rollback(&self) -> Vec<StatefulConnection> {
        let mut guard = self.inner.lock();
        guard.open = false;
        guard.reserved.clear();
        guard.conns.drain().map(|(_, conn)| conn).collect()
    }

    /// Number of held connections.
    pub fn len(&self) -> usize {
        self.inner.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
