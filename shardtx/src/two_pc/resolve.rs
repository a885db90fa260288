//! Finishing distributed transactions after the fact.
//!
//! A transaction still in Prepare never got a commit decision, so it's
//! rolled back. Participants are driven in parallel and every failure
//! is reported, not just the first.

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use crate::context::Context;
use crate::tx::{Error, TxEngine};

use super::{DtState, Target, TransactionMetadata};

/// Gateway to the shards taking part in distributed transactions.
#[async_trait]
pub trait Participants: Send + Sync {
    async fn commit_prepared(&self, ctx: &Context, target: &Target, dtid: &str)
        -> Result<(), Error>;

    async fn rollback_prepared(
        &self,
        ctx: &Context,
        target: &Target,
        dtid: &str,
    ) -> Result<(), Error>;
}

/// Resolves distributed transactions whose metadata lives on `engine`.
pub struct Resolver<P> {
    engine: TxEngine,
    participants: P,
}

impl<P: Participants> Resolver<P> {
    pub fn new(engine: TxEngine, participants: P) -> Self {
        Self {
            engine,
            participants,
        }
    }

    /// Drive `dtid` to its conclusion.
    pub async fn resolve_transaction(&self, ctx: &Context, dtid: &str) -> Result<(), Error> {
        let Some(tx) = self.engine.read_transaction(ctx, dtid).await? else {
            debug!("\"{}\" is already resolved", dtid);
            return Ok(());
        };

        info!("resolving \"{}\" in state {}", dtid, tx.state);

        match tx.state {
            DtState::Prepare => {
                self.engine.set_rollback(ctx, dtid, None).await?;
                self.rollback(ctx, &tx).await
            }
            DtState::Rollback => self.rollback(ctx, &tx).await,
            DtState::Commit => self.commit(ctx, &tx).await,
            DtState::Unknown => Err(crate::two_pc::Error::Decode {
                what: "transaction state",
                value: tx.state.to_string(),
            }
            .into()),
        }
    }

    async fn rollback(&self, ctx: &Context, tx: &TransactionMetadata) -> Result<(), Error> {
        let results = join_all(
            tx.participants
                .iter()
                .map(|target| self.participants.rollback_prepared(ctx, target, &tx.dtid)),
        )
        .await;
        aggregate(results)?;

        self.engine.conclude_transaction(ctx, &tx.dtid).await
    }

    async fn commit(&self, ctx: &Context, tx: &TransactionMetadata) -> Result<(), Error> {
        let results = join_all(
            tx.participants
                .iter()
                .map(|target| self.participants.commit_prepared(ctx, target, &tx.dtid)),
        )
        .await;
        aggregate(results)?;

        self.engine.conclude_transaction(ctx, &tx.dtid).await
    }
}

fn aggregate(results: Vec<Result<(), Error>>) -> Result<(), Error> {
    let mut errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}

/// Every participant is the local engine.
#[derive(Debug, Clone)]
pub struct LocalParticipants {
    engine: TxEngine,
}

impl LocalParticipants {
    pub fn new(engine: TxEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Participants for LocalParticipants {
    async fn commit_prepared(
        &self,
        ctx: &Context,
        _target: &Target,
        dtid: &str,
    ) -> Result<(), Error> {
        self.engine.commit_prepared(ctx, dtid).await
    }

    async fn rollback_prepared(
        &self,
        ctx: &Context,
        _target: &Target,
        dtid: &str,
    ) -> Result<(), Error> {
        self.engine.rollback_prepared(ctx, dtid, None).await
    }
}
