//! Who resolves abandoned distributed transactions.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::context::Context;
use crate::tx::{Error, TxEngine};

use super::{LocalParticipants, Resolver};

/// Something that can drive a distributed transaction to completion.
#[async_trait]
pub trait Coordinator: Send + Sync + Debug {
    async fn connect(
        &self,
        ctx: &Context,
        engine: &TxEngine,
    ) -> Result<Box<dyn CoordinatorSession>, Error>;
}

/// Connection to a coordinator.
#[async_trait]
pub trait CoordinatorSession: Send + Sync {
    /// Ask the coordinator to finish `dtid`.
    async fn resolve_transaction(&self, ctx: &Context, dtid: &str) -> Result<(), Error>;

    async fn close(&self);
}

/// Resolves transactions in-process, for deployments where every
/// participant is served by the same engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCoordinator;

struct LocalSession {
    resolver: Resolver<LocalParticipants>,
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn connect(
        &self,
        _ctx: &Context,
        engine: &TxEngine,
    ) -> Result<Box<dyn CoordinatorSession>, Error> {
        Ok(Box::new(LocalSession {
            resolver: Resolver::new(engine.clone(), LocalParticipants::new(engine.clone())),
        }))
    }
}

#[async_trait]
impl CoordinatorSession for LocalSession {
    async fn resolve_transaction(&self, ctx: &Context, dtid: &str) -> Result<(), Error> {
        self.resolver.resolve_transaction(ctx, dtid).await
    }

    async fn close(&self) {}
}
