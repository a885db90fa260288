use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardtx_config::{Config, CoordinatorKind};
use tokio::time::sleep;

use crate::backend::{self, MemoryDb, QueryResult, StatefulConnectionPool};
use crate::context::{Caller, Context};
use crate::env::Env;
use crate::test::{config, env, memory_connector};
use crate::tx::{self, Code, TxEngine, TxOptions};

use super::*;

fn row(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

fn two_pc_config() -> Config {
    let mut config = config();
    config.two_pc.enabled = true;
    config
}

/// Engine serving reads and writes, with `script` applied before it opens.
async fn engine_with(config: Config, script: impl FnOnce(&MemoryDb)) -> (MemoryDb, TxEngine) {
    crate::logger();
    let db = MemoryDb::new();
    db.add_query_pattern(r"^update _shardtx\.dt_state ", QueryResult::affected(1))
        .unwrap();
    script(&db);

    let env = Env::new(config);
    let engine = TxEngine::new(&env, Arc::new(db.clone()));
    engine.accept_read_write().await;
    db.clear_log();

    (db, engine)
}

async fn engine() -> (MemoryDb, TxEngine) {
    engine_with(two_pc_config(), |_| ()).await
}

fn ctx() -> Context {
    Context::new(Caller::new("app", "10.0.0.1"))
}

/// Open a transaction that inserted one row.
async fn write_tx(engine: &TxEngine, ctx: &Context) -> (i64, String) {
    let (id, _) = engine.begin(ctx, &TxOptions::default(), &[]).await.unwrap();
    engine
        .execute(ctx, id, "insert into t values (1)", 0)
        .await
        .unwrap();
    (id, Dtid::new("ks", "-80", id).to_string())
}

fn position(db: &MemoryDb, query: &str) -> Option<usize> {
    db.queries().iter().position(|q| q == query)
}

#[tokio::test]
async fn test_prepare_and_commit() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;

    engine.prepare(&ctx, id, &dtid).await.unwrap();
    assert_eq!(engine.engine_state().prepared, 1);
    assert!(db.queries().contains(&format!(
        "insert into _shardtx.redo_statement(dtid, id, statement) values ('{}', 1, 'insert into t values (1)')",
        dtid
    )));

    // Held by the prepared pool, not usable directly.
    assert!(engine.commit(&ctx, id).await.is_err());
    assert_eq!(engine.tx_pool().scp().size(), 1);

    db.clear_log();
    engine.commit_prepared(&ctx, &dtid).await.unwrap();
    assert_eq!(
        db.queries(),
        vec![
            format!("delete from _shardtx.redo_state where dtid = '{}'", dtid),
            format!("delete from _shardtx.redo_statement where dtid = '{}'", dtid),
            "commit".to_string(),
        ]
    );
    assert_eq!(engine.engine_state().prepared, 0);
    assert_eq!(engine.tx_pool().scp().size(), 0);

    // Already resolved.
    engine.commit_prepared(&ctx, &dtid).await.unwrap();

    let counts = engine.env().stats().counts();
    assert_eq!(counts.prepares, 1);
    assert_eq!(counts.commit_prepared, 1);
}

#[tokio::test]
async fn test_prepare_empty_transaction() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine
        .execute(&ctx, id, "select * from t", 0)
        .await
        .unwrap();
    engine.prepare(&ctx, id, "ks:-80:1").await.unwrap();

    assert_eq!(engine.engine_state().prepared, 0);
    assert_eq!(engine.tx_pool().scp().size(), 0);
    assert_eq!(db.queries(), vec!["begin", "select * from t", "rollback"]);
}

#[tokio::test]
async fn test_prepare_exceeds_limit() {
    let mut config = two_pc_config();
    config.tx_pool.size = 3;
    let (_db, engine) = engine_with(config, |_| ()).await;
    let ctx = ctx();

    let (first, first_dtid) = write_tx(&engine, &ctx).await;
    let (second, second_dtid) = write_tx(&engine, &ctx).await;

    engine.prepare(&ctx, first, &first_dtid).await.unwrap();
    let err = engine
        .prepare(&ctx, second, &second_dtid)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "prepared transactions exceeded limit: 1");
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(engine.tx_pool().scp().size(), 1);
}

#[tokio::test]
async fn test_prepare_without_redo_rolls_back() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;

    // The redo log transaction can't start.
    db.reject(
        "begin",
        backend::Error::sql(1205, "HY000", "Lock wait timeout exceeded"),
        Some(1),
    );

    assert!(engine.prepare(&ctx, id, &dtid).await.is_err());
    assert_eq!(engine.engine_state().prepared, 0);
    assert_eq!(engine.tx_pool().scp().size(), 0);
    assert_eq!(db.count("rollback"), 1);
}

#[tokio::test]
async fn test_commit_prepared_failure_is_sticky() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;
    engine.prepare(&ctx, id, &dtid).await.unwrap();

    db.reject(
        &format!("delete from _shardtx.redo_state where dtid = '{}'", dtid),
        backend::Error::sql(1105, "HY000", "unknown error"),
        None,
    );

    let err = engine.commit_prepared(&ctx, &dtid).await.unwrap_err();
    assert!(err.to_string().contains("unknown error"));
    assert!(db.queries().contains(&format!(
        "update _shardtx.redo_state set state = 0 where dtid = '{}'",
        dtid
    )));

    let err = engine.commit_prepared(&ctx, &dtid).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("cannot commit dtid {}, state: failed", dtid)
    );
    assert_eq!(err.code(), Code::FailedPrecondition);

    assert_eq!(engine.env().stats().counts().commit_prepared_failed, 1);
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test]
async fn test_rollback_prepared() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;
    engine.prepare(&ctx, id, &dtid).await.unwrap();

    db.clear_log();
    engine.rollback_prepared(&ctx, &dtid, None).await.unwrap();

    assert_eq!(
        db.queries(),
        vec![
            "begin".to_string(),
            format!("delete from _shardtx.redo_state where dtid = '{}'", dtid),
            format!("delete from _shardtx.redo_statement where dtid = '{}'", dtid),
            "commit".to_string(),
            "rollback".to_string(),
        ]
    );
    assert_eq!(engine.engine_state().prepared, 0);
    assert_eq!(engine.tx_pool().scp().size(), 0);
    assert_eq!(engine.env().stats().counts().rollback_prepared, 1);
}

#[tokio::test]
async fn test_rollback_prepared_with_original() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;

    engine
        .rollback_prepared(&ctx, &dtid, Some(id))
        .await
        .unwrap();

    assert_eq!(db.count("rollback"), 1);
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test]
async fn test_transaction_metadata() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let dtid = "ks:-80:1";
    let participants = vec![Target::new("ks", "-80"), Target::new("ks", "80-")];

    engine
        .create_transaction(&ctx, dtid, &participants)
        .await
        .unwrap();
    let queries = db.queries();
    assert_eq!(queries.first().map(|q| q.as_str()), Some("begin"));
    assert!(queries[1].starts_with(
        "insert into _shardtx.dt_state(dtid, state, time_created) values ('ks:-80:1', 1, "
    ));
    assert_eq!(
        queries[2],
        "insert into _shardtx.dt_participant(dtid, id, schema_name, shard) values ('ks:-80:1', 1, 'ks', '-80'), ('ks:-80:1', 2, 'ks', '80-')"
    );
    assert_eq!(queries[3], "commit");

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    db.clear_log();
    engine.start_commit(&ctx, id, dtid).await.unwrap();
    assert_eq!(
        db.queries(),
        vec![
            "update _shardtx.dt_state set state = 2 where dtid = 'ks:-80:1' and state = 1",
            "commit"
        ]
    );

    db.clear_log();
    engine.conclude_transaction(&ctx, dtid).await.unwrap();
    assert_eq!(
        db.queries(),
        vec![
            "begin",
            "delete from _shardtx.dt_state where dtid = 'ks:-80:1'",
            "delete from _shardtx.dt_participant where dtid = 'ks:-80:1'",
            "commit"
        ]
    );
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test]
async fn test_transition_needs_prepare_state() {
    let (db, engine) = engine().await;
    db.add_query(
        "update _shardtx.dt_state set state = 3 where dtid = 'ks:-80:9' and state = 1",
        QueryResult::affected(0),
    );

    let err = engine
        .set_rollback(&ctx(), "ks:-80:9", None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "could not transition to ROLLBACK: ks:-80:9");
    assert_eq!(db.count("rollback"), 1);
}

#[tokio::test]
async fn test_read_transactions() {
    let now = crate::util::unix_nanos(Utc::now()).to_string();
    let (_db, engine) = engine_with(two_pc_config(), |db| {
        db.add_query(
            "select dtid, state, time_created from _shardtx.dt_state where dtid = 'ks:-80:1'",
            QueryResult::rows(
                &["dtid", "state", "time_created"],
                vec![row(&["ks:-80:1", "1", "1700000000000000000"])],
            ),
        );
        db.add_query(
            "select schema_name, shard from _shardtx.dt_participant where dtid = 'ks:-80:1' order by id",
            QueryResult::rows(
                &["schema_name", "shard"],
                vec![row(&["ks", "-80"]), row(&["ks", "80-"])],
            ),
        );
        db.add_query_pattern(
            r"^select t\.dtid, t\.state, t\.time_created, p\.schema_name",
            QueryResult::rows(
                &["dtid", "state", "time_created", "schema_name", "shard"],
                vec![
                    row(&["ks:-80:1", "1", "0", "ks", "-80"]),
                    row(&["ks:-80:1", "1", "0", "ks", "80-"]),
                    row(&["ks:-80:2", "2", now.as_str(), "ks", "-80"]),
                ],
            ),
        )
        .unwrap();
    })
    .await;
    let ctx = ctx();

    let tx = engine
        .read_transaction(&ctx, "ks:-80:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.state, DtState::Prepare);
    assert_eq!(
        tx.created,
        DateTime::from_timestamp_nanos(1_700_000_000_000_000_000)
    );
    assert_eq!(
        tx.participants,
        vec![Target::new("ks", "-80"), Target::new("ks", "80-")]
    );

    let json = serde_json::to_value(&tx).unwrap();
    assert_eq!(json["state"], "PREPARE");
    assert_eq!(json["participants"][1]["shard"], "80-");

    assert!(engine
        .read_transaction(&ctx, "ks:-80:2")
        .await
        .unwrap()
        .is_none());

    let all = engine.read_all_transactions(&ctx).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].participants.len(), 2);
    assert_eq!(all[1].state, DtState::Commit);

    let unresolved = engine
        .unresolved_transactions(&ctx, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].dtid, "ks:-80:1");
}

#[tokio::test]
async fn test_recover_from_redo() {
    let (db, engine) = engine_with(two_pc_config(), |db| {
        db.add_query_pattern(
            r"^select t\.dtid, t\.state, t\.time_created, s\.statement",
            QueryResult::rows(
                &["dtid", "state", "time_created", "statement"],
                vec![
                    row(&["ks:-80:100", "1", "0", "insert into t values (1)"]),
                    row(&["ks:-80:100", "1", "0", "update t set a = 1"]),
                    row(&["ks:-80:200", "0", "0", "insert into t values (2)"]),
                    row(&["ks:-80:300", "1", "0", "insert into broken values (3)"]),
                ],
            ),
        )
        .unwrap();
        db.reject(
            "insert into broken values (3)",
            backend::Error::sql(1146, "42S02", "Table 'broken' doesn't exist"),
            None,
        );
    })
    .await;
    let ctx = ctx();

    assert_eq!(engine.engine_state().prepared, 1);
    assert_eq!(engine.env().stats().counts().redo_failed, 1);

    let err = engine
        .commit_prepared(&ctx, "ks:-80:200")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot commit dtid ks:-80:200, state: failed"
    );

    // Nothing held for the broken one.
    engine.commit_prepared(&ctx, "ks:-80:300").await.unwrap();

    engine.commit_prepared(&ctx, "ks:-80:100").await.unwrap();
    assert!(position(&db, "delete from _shardtx.redo_state where dtid = 'ks:-80:100'").is_some());
    assert_eq!(engine.engine_state().prepared, 0);
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test]
async fn test_close_rolls_back_prepared() {
    let (db, engine) = engine().await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;
    engine.prepare(&ctx, id, &dtid).await.unwrap();

    engine.close().await;

    assert_eq!(engine.tx_pool().scp().size(), 0);
    assert_eq!(db.count("rollback"), 1);
    assert_eq!(engine.engine_state().prepared, 0);
}

#[tokio::test]
async fn test_two_pc_disabled() {
    let (_db, engine) = engine_with(config(), |_| ()).await;
    let ctx = ctx();
    let (id, dtid) = write_tx(&engine, &ctx).await;

    let err = engine.prepare(&ctx, id, &dtid).await.unwrap_err();
    assert!(matches!(err, tx::Error::TwoPcDisabled));
    assert_eq!(err.code(), Code::FailedPrecondition);
}

/// Records calls, failing for the given shard.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    fail: Option<String>,
}

impl Recorder {
    fn record(&self, action: &str, target: &Target, dtid: &str) -> Result<(), tx::Error> {
        self.calls
            .lock()
            .push(format!("{} {} {}", action, target, dtid));

        if self.fail.as_deref() == Some(target.shard.as_str()) {
            return Err(backend::Error::sql(2003, "HY000", format!("{} is down", target)).into());
        }
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl Participants for Recorder {
    async fn commit_prepared(
        &self,
        _ctx: &Context,
        target: &Target,
        dtid: &str,
    ) -> Result<(), tx::Error> {
        self.record("commit", target, dtid)
    }

    async fn rollback_prepared(
        &self,
        _ctx: &Context,
        target: &Target,
        dtid: &str,
    ) -> Result<(), tx::Error> {
        self.record("rollback", target, dtid)
    }
}

fn script_transaction(db: &MemoryDb, dtid: &str, state: DtState) {
    db.add_query(
        &format!(
            "select dtid, state, time_created from _shardtx.dt_state where dtid = '{}'",
            dtid
        ),
        QueryResult::rows(
            &["dtid", "state", "time_created"],
            vec![row(&[dtid, state.as_i64().to_string().as_str(), "0"])],
        ),
    );
    db.add_query(
        &format!(
            "select schema_name, shard from _shardtx.dt_participant where dtid = '{}' order by id",
            dtid
        ),
        QueryResult::rows(
            &["schema_name", "shard"],
            vec![row(&["ks", "-80"]), row(&["ks", "80-"])],
        ),
    );
}

#[tokio::test]
async fn test_resolve_prepared_rolls_back() {
    let (db, engine) = engine().await;
    script_transaction(&db, "ks:-80:1", DtState::Prepare);

    let recorder = Recorder::default();
    let resolver = Resolver::new(engine.clone(), recorder.clone());
    resolver.resolve_transaction(&ctx(), "ks:-80:1").await.unwrap();

    assert_eq!(
        recorder.calls(),
        vec!["rollback ks/-80 ks:-80:1", "rollback ks/80- ks:-80:1"]
    );

    let decided = position(
        &db,
        "update _shardtx.dt_state set state = 3 where dtid = 'ks:-80:1' and state = 1",
    )
    .unwrap();
    let concluded = position(&db, "delete from _shardtx.dt_state where dtid = 'ks:-80:1'").unwrap();
    assert!(decided < concluded);
}

#[tokio::test]
async fn test_resolve_commit_aggregates_errors() {
    let (db, engine) = engine().await;
    script_transaction(&db, "ks:-80:2", DtState::Commit);

    let recorder = Recorder {
        fail: Some("80-".into()),
        ..Default::default()
    };
    let resolver = Resolver::new(engine.clone(), recorder.clone());
    let err = resolver
        .resolve_transaction(&ctx(), "ks:-80:2")
        .await
        .unwrap_err();

    // Every participant was tried.
    assert_eq!(
        recorder.calls(),
        vec!["commit ks/-80 ks:-80:2", "commit ks/80- ks:-80:2"]
    );
    assert!(err.to_string().contains("ks/80- is down"));

    // Not concluded until every participant is done.
    assert_eq!(
        position(&db, "delete from _shardtx.dt_state where dtid = 'ks:-80:2'"),
        None
    );
}

#[tokio::test]
async fn test_resolve_unknown_dtid() {
    let (_db, engine) = engine().await;
    let recorder = Recorder::default();
    let resolver = Resolver::new(engine.clone(), recorder.clone());

    resolver.resolve_transaction(&ctx(), "ks:-80:3").await.unwrap();
    assert!(recorder.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_resolves_abandoned() {
    let mut config = two_pc_config();
    config.two_pc.coordinator = CoordinatorKind::Local;
    config.two_pc.abandon_age = 1_000;

    let (db, engine) = engine_with(config, |db| {
        db.add_query_pattern(
            r"^select count\(\*\) from _shardtx\.redo_state",
            QueryResult::rows(&["count(*)"], vec![row(&["2"])]),
        )
        .unwrap();
        db.add_query_pattern(
            r"^select dtid from _shardtx\.dt_state where time_created <",
            QueryResult::rows(&["dtid"], vec![row(&["ks:-80:1"])]),
        )
        .unwrap();
        db.add_query(
            "select dtid, state, time_created from _shardtx.dt_state where dtid = 'ks:-80:1'",
            QueryResult::rows(
                &["dtid", "state", "time_created"],
                vec![row(&["ks:-80:1", "1", "0"])],
            ),
        );
    })
    .await;

    sleep(Duration::from_millis(600)).await;

    assert_eq!(engine.env().stats().unresolved_prepared(), 2);
    assert!(db.count("delete from _shardtx.dt_state where dtid = 'ks:-80:1'") >= 1);
    assert_eq!(engine.env().stats().counts().watchdog_failures, 0);

    engine.close().await;
}

#[tokio::test]
async fn test_prepared_pool() {
    let env = env();
    let (_db, connector) = memory_connector();
    let scp = StatefulConnectionPool::new(&env);
    scp.open(&connector);
    let ctx = Context::default();

    let mut conns = vec![];
    for _ in 0..3 {
        conns.push(scp.new_conn(&ctx, false).await.unwrap());
    }
    let (c, b, a) = (
        conns.pop().unwrap(),
        conns.pop().unwrap(),
        conns.pop().unwrap(),
    );

    let pool = PreparedPool::new(2);
    let (a, err) = pool.put(a, "d1").unwrap_err();
    assert!(matches!(err, Error::Shutdown));

    pool.open();
    pool.put(a, "d1").unwrap();
    let (b, err) = pool.put(b, "d1").unwrap_err();
    assert_eq!(err.to_string(), "duplicate DTID in Prepare: d1");
    pool.put(b, "d2").unwrap();
    let (c, err) = pool.put(c, "d3").unwrap_err();
    assert_eq!(err.to_string(), "prepared transactions exceeded limit: 2");
    scp.release(c, "test");

    let a = pool.fetch_for_commit("d1").unwrap().unwrap();
    let err = pool.fetch_for_commit("d1").unwrap_err();
    assert_eq!(err.to_string(), "cannot commit dtid d1, state: committing");
    assert!(pool.fetch_for_rollback("d1").is_none());
    pool.forget("d1");
    assert!(pool.fetch_for_commit("d1").unwrap().is_none());
    scp.release(a, "test");

    pool.set_failed("d2");
    let err = pool.fetch_for_commit("d2").unwrap_err();
    assert_eq!(err.to_string(), "cannot commit dtid d2, state: failed");
    assert!(pool.fetch_for_rollback("d2").is_none());

    let all = pool.fetch_all_for_rollback();
    assert_eq!(all.len(), 1);
    assert!(pool.is_empty());
    assert!(matches!(pool.fetch_for_commit("d2"), Err(Error::Shutdown)));

    for conn in all {
        scp.release(conn, "test");
    }
    assert_eq!(scp.size(), 0);
}
