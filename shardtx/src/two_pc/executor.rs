//! Two-phase commit operations on the transaction engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::backend::StatefulConnection;
use crate::context::Context;
use crate::tx::{Error, TxEngine, TxOptions};

use super::{DtState, Dtid, RedoState, Target, TransactionMetadata};

impl TxEngine {
    fn ensure_two_pc(&self) -> Result<(), Error> {
        if self.two_pc_enabled() {
            Ok(())
        } else {
            Err(Error::TwoPcDisabled)
        }
    }

    /// Short transaction for metadata writes.
    async fn local_begin(&self, ctx: &Context) -> Result<StatefulConnection, Error> {
        let (conn, _) = self
            .inner
            .tx_pool
            .begin(ctx, &TxOptions::default(), false, None, &[])
            .await?;
        Ok(conn)
    }

    /// Commit the local transaction if `result` is ok, roll it back otherwise. Always releases.
    async fn local_finish(
        &self,
        ctx: &Context,
        mut conn: StatefulConnection,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        let tx_pool = &self.inner.tx_pool;
        let result = match result {
            Ok(()) => tx_pool.commit(ctx, &mut conn).await.map(|_| ()),
            Err(err) => Err(err),
        };
        tx_pool.rollback_and_release(ctx, conn).await;
        result
    }

    /// Prepare transaction `id` for commit under `dtid`.
    ///
    /// The connection moves to the prepared pool and its statements are
    /// written to the redo log. A transaction that changed nothing is rolled
    /// back instead.
    pub async fn prepare(&self, ctx: &Context, id: i64, dtid: &str) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let tx_pool = &self.inner.tx_pool;
        let conn = tx_pool.get_and_lock(id, "for prepare")?;

        let queries = match conn.tx_props() {
            Some(props) if !props.queries.is_empty() => props.queries.clone(),
            _ => {
                tx_pool.rollback_and_release(ctx, conn).await;
                return Ok(());
            }
        };

        if let Err((conn, err)) = self.inner.prepared.put(conn, dtid) {
            tx_pool.rollback_and_release(ctx, conn).await;
            return Err(err.into());
        }

        let conn = self.local_begin(ctx).await;
        let result = match conn {
            Ok(mut conn) => {
                let result = self
                    .inner
                    .store
                    .save_redo(ctx, &mut conn, dtid, &queries)
                    .await
                    .map_err(Error::from);
                self.local_finish(ctx, conn, result).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.inner.env.stats().prepare();
                Ok(())
            }

            // Not durable, so not prepared.
            Err(err) => {
                error!("could not save redo log for \"{}\": {}", dtid, err);
                if let Some(conn) = self.inner.prepared.fetch_for_rollback(dtid) {
                    tx_pool.rollback_and_release(ctx, conn).await;
                }
                Err(err)
            }
        }
    }

    /// Commit a prepared transaction. An unknown dtid was already resolved.
    pub async fn commit_prepared(&self, ctx: &Context, dtid: &str) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let Some(mut conn) = self.inner.prepared.fetch_for_commit(dtid)? else {
            return Ok(());
        };

        // Runs to the end regardless of the caller's deadline.
        let local = Context::new(ctx.caller.clone());
        let tx_pool = &self.inner.tx_pool;

        let result = match self.inner.store.delete_redo(&local, &mut conn, dtid).await {
            Ok(()) => tx_pool.commit(&local, &mut conn).await.map(|_| ()),
            Err(err) => Err(err.into()),
        };

        match &result {
            Ok(()) => {
                self.inner.prepared.forget(dtid);
                self.inner.env.stats().commit_prepared();
            }
            Err(err) => {
                error!("commit of prepared transaction \"{}\" failed: {}", dtid, err);
                self.mark_failed(&local, dtid).await;
            }
        }

        tx_pool.rollback_and_release(&local, conn).await;
        result
    }

    /// Record a failed commit. Retries report the failure until an operator steps in.
    async fn mark_failed(&self, ctx: &Context, dtid: &str) {
        self.inner.env.stats().commit_prepared_failed();
        self.inner.prepared.set_failed(dtid);

        let mut conn = match self.local_begin(ctx).await {
            Ok(conn) => conn,
            Err(err) => {
                error!("could not mark \"{}\" failed: {}", dtid, err);
                return;
            }
        };

        let result = self
            .inner
            .store
            .update_redo(ctx, &mut conn, dtid, RedoState::Failed)
            .await
            .map_err(Error::from);

        if let Err(err) = self.local_finish(ctx, conn, result).await {
            error!("could not mark \"{}\" failed: {}", dtid, err);
        }
    }

    /// Roll back a prepared transaction. `original_id` is the transaction
    /// that was never prepared, if it's still open.
    pub async fn rollback_prepared(
        &self,
        ctx: &Context,
        dtid: &str,
        original_id: Option<i64>,
    ) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let result = match self.local_begin(ctx).await {
            Ok(mut conn) => {
                let result = self
                    .inner
                    .store
                    .delete_redo(ctx, &mut conn, dtid)
                    .await
                    .map_err(Error::from);
                self.local_finish(ctx, conn, result).await
            }
            Err(err) => Err(err),
        };

        if let Some(conn) = self.inner.prepared.fetch_for_rollback(dtid) {
            self.inner.tx_pool.rollback_and_release(ctx, conn).await;
        }

        if let Some(id) = original_id {
            if let Err(err) = self.rollback(ctx, id).await {
                warn!("rollback of transaction {} failed: {}", id, err);
            }
        }

        if result.is_ok() {
            self.inner.env.stats().rollback_prepared();
        }

        result
    }

    /// Record a new distributed transaction in Prepare state.
    pub async fn create_transaction(
        &self,
        ctx: &Context,
        dtid: &str,
        participants: &[Target],
    ) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let mut conn = self.local_begin(ctx).await?;
        let result = self
            .inner
            .store
            .create_transaction(ctx, &mut conn, dtid, participants)
            .await
            .map_err(Error::from);
        self.local_finish(ctx, conn, result).await
    }

    /// Commit transaction `id` together with the decision to commit `dtid`.
    pub async fn start_commit(&self, ctx: &Context, id: i64, dtid: &str) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let tx_pool = &self.inner.tx_pool;
        let mut conn = tx_pool.get_and_lock(id, "for 2pc commit")?;

        let result = match self
            .inner
            .store
            .transition(ctx, &mut conn, dtid, DtState::Commit)
            .await
        {
            Ok(()) => tx_pool.commit(ctx, &mut conn).await.map(|_| ()),
            Err(err) => Err(err.into()),
        };

        tx_pool.rollback_and_release(ctx, conn).await;
        result
    }

    /// Decide to roll back `dtid`, rolling back transaction `id` first if it's still open.
    pub async fn set_rollback(
        &self,
        ctx: &Context,
        dtid: &str,
        id: Option<i64>,
    ) -> Result<(), Error> {
        self.ensure_two_pc()?;

        if let Some(id) = id {
            if let Err(err) = self.rollback(ctx, id).await {
                warn!("rollback of transaction {} failed: {}", id, err);
            }
        }

        let mut conn = self.local_begin(ctx).await?;
        let result = self
            .inner
            .store
            .transition(ctx, &mut conn, dtid, DtState::Rollback)
            .await
            .map_err(Error::from);
        self.local_finish(ctx, conn, result).await
    }

    /// Forget a resolved distributed transaction.
    pub async fn conclude_transaction(&self, ctx: &Context, dtid: &str) -> Result<(), Error> {
        self.ensure_two_pc()?;

        let mut conn = self.local_begin(ctx).await?;
        let result = self
            .inner
            .store
            .delete_transaction(ctx, &mut conn, dtid)
            .await
            .map_err(Error::from);
        self.local_finish(ctx, conn, result).await
    }

    pub async fn read_transaction(
        &self,
        ctx: &Context,
        dtid: &str,
    ) -> Result<Option<TransactionMetadata>, Error> {
        self.ensure_two_pc()?;
        Ok(self.inner.store.read_transaction(ctx, dtid).await?)
    }

    pub async fn read_all_transactions(
        &self,
        ctx: &Context,
    ) -> Result<Vec<TransactionMetadata>, Error> {
        self.ensure_two_pc()?;
        Ok(self.inner.store.read_all_transactions(ctx).await?)
    }

    /// Distributed transactions older than `age`.
    pub async fn unresolved_transactions(
        &self,
        ctx: &Context,
        age: Duration,
    ) -> Result<Vec<TransactionMetadata>, Error> {
        self.ensure_two_pc()?;
        let before = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(self
            .inner
            .store
            .read_all_transactions(ctx)
            .await?
            .into_iter()
            .filter(|tx| tx.created < before)
            .collect())
    }

    /// Reopen transactions found in the redo log and hold them as prepared.
    ///
    /// Statements are replayed as logged. Ids are moved past the highest one seen.
    pub(crate) async fn prepare_from_redo(&self) -> Result<(), Error> {
        let ctx = Context::default();
        let (prepared, failed) = self.inner.store.read_all_redo(&ctx).await?;
        let tx_pool = &self.inner.tx_pool;
        let stats = self.inner.env.stats();
        let mut max_id = 0;
        let mut errors = vec![];

        'prepared: for tx in &prepared {
            match tx.dtid.parse::<Dtid>() {
                Ok(dtid) => max_id = max_id.max(dtid.transaction_id),
                Err(err) => {
                    error!("skipping redo entry: {}", err);
                    stats.redo_failed();
                    continue;
                }
            }

            let mut conn = match self.local_begin(&ctx).await {
                Ok(conn) => conn,
                Err(err) => {
                    stats.redo_failed();
                    errors.push(err);
                    continue;
                }
            };

            for query in &tx.queries {
                conn.record_query(query);
                if let Err(err) = conn.exec(&ctx, query, 1).await {
                    stats.redo_failed();
                    errors.push(err.into());
                    tx_pool.rollback_and_release(&ctx, conn).await;
                    continue 'prepared;
                }
            }

            if let Err((conn, err)) = self.inner.prepared.put(conn, &tx.dtid) {
                stats.redo_failed();
                errors.push(err.into());
                tx_pool.rollback_and_release(&ctx, conn).await;
                continue;
            }
        }

        for tx in &failed {
            if let Ok(dtid) = tx.dtid.parse::<Dtid>() {
                max_id = max_id.max(dtid.transaction_id);
            }
            self.inner.prepared.set_failed(&tx.dtid);
        }

        tx_pool.adjust_last_id(max_id);

        info!(
            "recovered {} prepared transactions, {} failures",
            prepared.len(),
            failed.len()
        );

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}
