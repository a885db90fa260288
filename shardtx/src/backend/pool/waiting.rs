use tokio::sync::oneshot::{channel, Receiver};
use tokio::time::{timeout_at, Instant};

use super::{Error, Grant, Inner, Pool, Waiter};

/// Caller in line for a connection.
///
/// A grant that arrives after the caller gave up goes back to the pool on drop.
pub(super) struct Waiting {
    rx: Receiver<Grant>,
    since: Instant,
    pool: Pool,
}

impl Waiting {
    /// Get in line. Fails right away if the line is full.
    pub(super) fn new(pool: &Pool, inner: &mut Inner) -> Result<Self, Error> {
        inner.prune_waiters();

        if inner.queue_full() {
            return Err(Error::WaiterCapExceeded(inner.config.max_waiters));
        }

        let (tx, rx) = channel();
        let since = Instant::now();
        inner.waiting.push_back(Waiter { tx, since });

        Ok(Self {
            rx,
            since,
            pool: pool.clone(),
        })
    }

    pub(super) async fn wait(mut self, deadline: Instant) -> Result<Grant, Error> {
        let pool = self.pool.clone();
        let result = timeout_at(deadline, &mut self.rx).await;

        match result {
            Ok(Ok(grant)) => {
                pool.record_wait(self.since.elapsed());
                Ok(grant)
            }

            // Pool shut down while we were waiting.
            Ok(Err(_)) => Err(Error::Offline),

            Err(_) => {
                // A grant may have landed right as we timed out.
                self.rx.close();
                match self.rx.try_recv() {
                    Ok(grant) => {
                        pool.record_wait(self.since.elapsed());
                        Ok(grant)
                    }
                    Err(_) => {
                        pool.lock().counts.checkout_timeouts += 1;
                        Err(Error::CheckoutTimeout)
                    }
                }
            }
        }
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Grant::Conn(conn)) => self.pool.put(Some(conn)),
            Ok(Grant::Slot) => self.pool.put(None),
            Err(_) => (),
        }
    }
}
