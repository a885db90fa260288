//! Redo log and distributed transaction metadata.
//!
//! [`SqlStore`] keeps both in the `_shardtx` sidecar schema of the
//! database it serves. Writes go through the caller's transaction so they
//! commit or roll back with it. Reads use a small pool of their own.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::pool::{self, Pool};
use crate::backend::{Connector, QueryResult, StatefulConnection};
use crate::context::Context;
use crate::env::Env;
use crate::util::{quote_string, unix_nanos};

use super::{DtState, Error, PreparedTx, RedoState, Target, TransactionMetadata};

/// Connections in the read pool.
const READ_POOL_SIZE: usize = 3;

const SCHEMA: &[&str] = &[
    "create database if not exists _shardtx",
    "create table if not exists _shardtx.redo_state(
  dtid varbinary(512) not null,
  state bigint not null,
  time_created bigint not null,
  primary key(dtid))",
    "create table if not exists _shardtx.redo_statement(
  dtid varbinary(512) not null,
  id bigint not null,
  statement mediumblob not null,
  primary key(dtid, id))",
    "create table if not exists _shardtx.dt_state(
  dtid varbinary(512) not null,
  state bigint not null,
  time_created bigint not null,
  primary key(dtid))",
    "create table if not exists _shardtx.dt_participant(
  dtid varbinary(512) not null,
  id bigint not null,
  schema_name varchar(256) not null,
  shard varchar(256) not null,
  primary key(dtid, id))",
];

/// Storage for prepared transactions and distributed transaction records.
#[async_trait]
pub trait TwoPcStore: Send + Sync + Debug {
    async fn open(&self, connector: &Connector) -> Result<(), Error>;

    async fn close(&self);

    /// Log a prepared transaction's statements.
    async fn save_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        queries: &[String],
    ) -> Result<(), Error>;

    async fn delete_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
    ) -> Result<(), Error>;

    async fn update_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        state: RedoState,
    ) -> Result<(), Error>;

    /// Every redo entry, split into prepared and failed.
    async fn read_all_redo(&self, ctx: &Context)
        -> Result<(Vec<PreparedTx>, Vec<PreparedTx>), Error>;

    /// Redo entries created before `before`.
    async fn count_unresolved_redo(&self, ctx: &Context, before: DateTime<Utc>)
        -> Result<u64, Error>;

    /// Dtids of distributed transactions created before `before`.
    async fn read_abandoned(&self, ctx: &Context, before: DateTime<Utc>)
        -> Result<Vec<String>, Error>;

    async fn create_transaction(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        participants: &[Target],
    ) -> Result<(), Error>;

    /// Move a distributed transaction out of Prepare.
    async fn transition(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        state: DtState,
    ) -> Result<(), Error>;

    async fn delete_transaction(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
    ) -> Result<(), Error>;

    async fn read_transaction(
        &self,
        ctx: &Context,
        dtid: &str,
    ) -> Result<Option<TransactionMetadata>, Error>;

    async fn read_all_transactions(&self, ctx: &Context)
        -> Result<Vec<TransactionMetadata>, Error>;
}

/// [`TwoPcStore`] on top of SQL tables.
#[derive(Debug)]
pub struct SqlStore {
    env: Env,
    pool: Mutex<Option<Pool>>,
}

impl SqlStore {
    pub fn new(env: &Env) -> Self {
        Self {
            env: env.clone(),
            pool: Mutex::new(None),
        }
    }

    async fn read(&self, ctx: &Context, query: &str) -> Result<QueryResult, Error> {
        let pool = self.pool.lock().clone().ok_or(Error::Shutdown)?;
        let mut conn = pool.get(ctx).await?;
        Ok(conn.exec(ctx, query, 0).await?)
    }
}

fn decode_i64(result: &QueryResult, row: usize, column: usize, what: &'static str) -> Result<i64, Error> {
    let value = result.value(row, column).unwrap_or_default();
    value.parse().map_err(|_| Error::Decode {
        what,
        value: value.to_string(),
    })
}

fn decode_time(result: &QueryResult, row: usize, column: usize) -> Result<DateTime<Utc>, Error> {
    let nanos = decode_i64(result, row, column, "time")?;
    Ok(DateTime::from_timestamp_nanos(nanos))
}

fn decode_string(result: &QueryResult, row: usize, column: usize) -> String {
    result.value(row, column).unwrap_or_default().to_string()
}

#[async_trait]
impl TwoPcStore for SqlStore {
    async fn open(&self, connector: &Connector) -> Result<(), Error> {
        let config = pool::Config {
            capacity: READ_POOL_SIZE,
            ..pool::Config::tx_pool(self.env.config())
        };
        let pool = Pool::new(config, connector.clone(), None, &self.env);
        pool.open();
        *self.pool.lock() = Some(pool);

        let ctx = Context::default();
        for statement in SCHEMA {
            self.read(&ctx, statement).await?;
        }

        debug!("redo log opened");
        Ok(())
    }

    async fn close(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    async fn save_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        queries: &[String],
    ) -> Result<(), Error> {
        let dtid = quote_string(dtid);

        conn.exec(
            ctx,
            &format!(
                "insert into _shardtx.redo_state(dtid, state, time_created) values ({}, {}, {})",
                dtid,
                RedoState::Prepared.as_i64(),
                unix_nanos(Utc::now())
            ),
            1,
        )
        .await?;

        let values = queries
            .iter()
            .enumerate()
            .map(|(id, query)| format!("({}, {}, {})", dtid, id + 1, quote_string(query)))
            .collect::<Vec<_>>()
            .join(", ");

        conn.exec(
            ctx,
            &format!(
                "insert into _shardtx.redo_statement(dtid, id, statement) values {}",
                values
            ),
            1,
        )
        .await?;

        Ok(())
    }

    async fn delete_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
    ) -> Result<(), Error> {
        let dtid = quote_string(dtid);
        conn.exec(
            ctx,
            &format!("delete from _shardtx.redo_state where dtid = {}", dtid),
            1,
        )
        .await?;
        conn.exec(
            ctx,
            &format!("delete from _shardtx.redo_statement where dtid = {}", dtid),
            1,
        )
        .await?;
        Ok(())
    }

    async fn update_redo(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        state: RedoState,
    ) -> Result<(), Error> {
        let result = conn
            .exec(
                ctx,
                &format!(
                    "update _shardtx.redo_state set state = {} where dtid = {}",
                    state.as_i64(),
                    quote_string(dtid)
                ),
                1,
            )
            .await?;

        if result.rows_affected != 1 {
            warn!(
                "redo state update for \"{}\" affected {} rows",
                dtid, result.rows_affected
            );
        }

        Ok(())
    }

    async fn read_all_redo(
        &self,
        ctx: &Context,
    ) -> Result<(Vec<PreparedTx>, Vec<PreparedTx>), Error> {
        let result = self
            .read(
                ctx,
                "select t.dtid, t.state, t.time_created, s.statement \
                 from _shardtx.redo_state t \
                 join _shardtx.redo_statement s on t.dtid = s.dtid \
                 order by t.dtid, s.id",
            )
            .await?;

        let mut entries: BTreeMap<String, (RedoState, PreparedTx)> = BTreeMap::new();

        for row in 0..result.rows.len() {
            let dtid = decode_string(&result, row, 0);
            let statement = decode_string(&result, row, 3);

            match entries.get_mut(&dtid) {
                Some((_, tx)) => tx.queries.push(statement),
                None => {
                    let state = RedoState::try_from(decode_i64(&result, row, 1, "redo state")?)?;
                    let tx = PreparedTx {
                        dtid: dtid.clone(),
                        queries: vec![statement],
                        created: decode_time(&result, row, 2)?,
                    };
                    entries.insert(dtid, (state, tx));
                }
            }
        }

        let (failed, prepared): (Vec<_>, Vec<_>) = entries
            .into_values()
            .partition(|(state, _)| *state == RedoState::Failed);

        Ok((
            prepared.into_iter().map(|(_, tx)| tx).collect(),
            failed.into_iter().map(|(_, tx)| tx).collect(),
        ))
    }

    async fn count_unresolved_redo(
        &self,
        ctx: &Context,
        before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let result = self
            .read(
                ctx,
                &format!(
                    "select count(*) from _shardtx.redo_state where time_created < {}",
                    unix_nanos(before)
                ),
            )
            .await?;

        if result.is_empty() {
            return Ok(0);
        }

        Ok(decode_i64(&result, 0, 0, "count")?.max(0) as u64)
    }

    async fn read_abandoned(
        &self,
        ctx: &Context,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, Error> {
        let result = self
            .read(
                ctx,
                &format!(
                    "select dtid from _shardtx.dt_state where time_created < {}",
                    unix_nanos(before)
                ),
            )
            .await?;

        Ok((0..result.rows.len())
            .map(|row| decode_string(&result, row, 0))
            .collect())
    }

    async fn create_transaction(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        participants: &[Target],
    ) -> Result<(), Error> {
        let dtid = quote_string(dtid);

        conn.exec(
            ctx,
            &format!(
                "insert into _shardtx.dt_state(dtid, state, time_created) values ({}, {}, {})",
                dtid,
                DtState::Prepare.as_i64(),
                unix_nanos(Utc::now())
            ),
            1,
        )
        .await?;

        if participants.is_empty() {
            return Ok(());
        }

        let values = participants
            .iter()
            .enumerate()
            .map(|(id, target)| {
                format!(
                    "({}, {}, {}, {})",
                    dtid,
                    id + 1,
                    quote_string(&target.schema),
                    quote_string(&target.shard)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        conn.exec(
            ctx,
            &format!(
                "insert into _shardtx.dt_participant(dtid, id, schema_name, shard) values {}",
                values
            ),
            1,
        )
        .await?;

        Ok(())
    }

    async fn transition(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
        state: DtState,
    ) -> Result<(), Error> {
        let result = conn
            .exec(
                ctx,
                &format!(
                    "update _shardtx.dt_state set state = {} where dtid = {} and state = {}",
                    state.as_i64(),
                    quote_string(dtid),
                    DtState::Prepare.as_i64()
                ),
                1,
            )
            .await?;

        if result.rows_affected != 1 {
            return Err(Error::Transition {
                state,
                dtid: dtid.to_string(),
            });
        }

        Ok(())
    }

    async fn delete_transaction(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        dtid: &str,
    ) -> Result<(), Error> {
        let dtid = quote_string(dtid);
        conn.exec(
            ctx,
            &format!("delete from _shardtx.dt_state where dtid = {}", dtid),
            1,
        )
        .await?;
        conn.exec(
            ctx,
            &format!("delete from _shardtx.dt_participant where dtid = {}", dtid),
            1,
        )
        .await?;
        Ok(())
    }

    async fn read_transaction(
        &self,
        ctx: &Context,
        dtid: &str,
    ) -> Result<Option<TransactionMetadata>, Error> {
        let quoted = quote_string(dtid);
        let result = self
            .read(
                ctx,
                &format!(
                    "select dtid, state, time_created from _shardtx.dt_state where dtid = {}",
                    quoted
                ),
            )
            .await?;

        if result.is_empty() {
            return Ok(None);
        }

        let state = DtState::try_from(decode_i64(&result, 0, 1, "transaction state")?)?;
        let created = decode_time(&result, 0, 2)?;

        let result = self
            .read(
                ctx,
                &format!(
                    "select schema_name, shard from _shardtx.dt_participant where dtid = {} order by id",
                    quoted
                ),
            )
            .await?;

        let participants = (0..result.rows.len())
            .map(|row| Target::new(decode_string(&result, row, 0), decode_string(&result, row, 1)))
            .collect();

        Ok(Some(TransactionMetadata {
            dtid: dtid.to_string(),
            state,
            created,
            participants,
        }))
    }

    async fn read_all_transactions(
        &self,
        ctx: &Context,
    ) -> Result<Vec<TransactionMetadata>, Error> {
        let result = self
            .read(
                ctx,
                "select t.dtid, t.state, t.time_created, p.schema_name, p.shard \
                 from _shardtx.dt_state t \
                 join _shardtx.dt_participant p on t.dtid = p.dtid \
                 order by t.dtid, p.id",
            )
            .await?;

        let mut transactions: Vec<TransactionMetadata> = vec![];

        for row in 0..result.rows.len() {
            let dtid = decode_string(&result, row, 0);
            let target = Target::new(decode_string(&result, row, 3), decode_string(&result, row, 4));

            match transactions.last_mut() {
                Some(last) if last.dtid == dtid => last.participants.push(target),
                _ => transactions.push(TransactionMetadata {
                    dtid,
                    state: DtState::try_from(decode_i64(&result, row, 1, "transaction state")?)?,
                    created: decode_time(&result, row, 2)?,
                    participants: vec![target],
                }),
            }
        }

        Ok(transactions)
    }
}
