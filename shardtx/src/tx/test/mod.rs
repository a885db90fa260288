use std::sync::Arc;
use std::time::Duration;

use shardtx_config::Config;
use tokio::spawn;
use tokio::task::yield_now;
use tokio::time::sleep;

use crate::backend::{self, MemoryDb};
use crate::context::{Caller, Context};
use crate::env::Env;
use crate::test::config;

use super::*;

async fn engine_with(config: Config) -> (MemoryDb, TxEngine) {
    crate::logger();
    let env = Env::new(config);
    let db = MemoryDb::new();
    let engine = TxEngine::new(&env, Arc::new(db.clone()));
    engine.accept_read_write().await;
    (db, engine)
}

async fn engine() -> (MemoryDb, TxEngine) {
    engine_with(config()).await
}

fn limited(fraction: f64) -> Config {
    let mut config = config();
    config.tx_limiter.enabled = true;
    config.tx_limiter.max_per_user = fraction;
    config
}

fn ctx() -> Context {
    Context::new(Caller::new("app", "10.0.0.1"))
}

#[tokio::test]
async fn test_begin_commit() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let (id, statements) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    assert_eq!(statements, "begin");
    assert_eq!(engine.tx_pool().scp().size(), 1);

    assert_eq!(engine.commit(&ctx, id).await.unwrap(), None);
    assert_eq!(db.queries(), vec!["begin", "commit"]);
    assert_eq!(engine.tx_pool().scp().size(), 0);

    let counts = engine.env().stats().counts();
    assert_eq!(counts.begins, 1);
    assert_eq!(counts.commits, 1);
}

#[tokio::test]
async fn test_autocommit() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let options = TxOptions::new(Isolation::Autocommit);
    let (id, statements) = engine.begin(&ctx, &options, &[]).await.unwrap();
    assert!(statements.is_empty());

    engine.execute(&ctx, id, "insert into t values (1)", 0).await.unwrap();
    engine.commit(&ctx, id).await.unwrap();

    assert_eq!(db.queries(), vec!["insert into t values (1)"]);
}

#[tokio::test]
async fn test_isolation_and_pre_queries() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let options = TxOptions::new(Isolation::Serializable);
    let (id, statements) = engine
        .begin(&ctx, &options, &["set @a = 1".to_string()])
        .await
        .unwrap();
    assert_eq!(statements, "set transaction isolation level serializable; begin");

    engine.rollback(&ctx, id).await.unwrap();
    assert_eq!(
        db.queries(),
        vec![
            "set transaction isolation level serializable",
            "begin",
            "set @a = 1",
            "rollback"
        ]
    );
}

#[tokio::test]
async fn test_read_only() {
    let (db, engine) = engine().await;
    engine.accept_read_only().await;
    assert_eq!(engine.state(), State::AcceptingReadOnly);

    let ctx = ctx();
    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine.commit(&ctx, id).await.unwrap();

    assert_eq!(db.queries(), vec!["start transaction read only", "commit"]);
}

#[tokio::test]
async fn test_not_accepting() {
    crate::logger();
    let env = Env::new(config());
    let engine = TxEngine::new(&env, Arc::new(MemoryDb::new()));

    let err = engine
        .begin(&ctx(), &TxOptions::default(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAccepting(State::NotServing)));
    assert_eq!(err.code(), Code::Unavailable);

    let err = engine.reserve(&ctx(), None, &[]).await.unwrap_err();
    assert!(matches!(err, Error::NotAccepting(State::NotServing)));
}

#[tokio::test]
async fn test_limiter() {
    // 5 * 0.4 = 2 slots.
    let (_db, engine) = engine_with(limited(0.4)).await;
    let ctx = ctx();
    let options = TxOptions::default();

    let (first, _) = engine.begin(&ctx, &options, &[]).await.unwrap();
    let _second = engine.begin(&ctx, &options, &[]).await.unwrap();

    let err = engine.begin(&ctx, &options, &[]).await.unwrap_err();
    assert!(matches!(err, Error::LimitExceeded));
    assert_eq!(err.code(), Code::ResourceExhausted);

    let other = Context::new(Caller::new("other", "10.0.0.2"));
    assert!(engine.begin(&other, &options, &[]).await.is_ok());

    engine.commit(&ctx, first).await.unwrap();
    assert!(engine.begin(&ctx, &options, &[]).await.is_ok());
}

#[tokio::test]
async fn test_begin_failure_releases_slot() {
    // 5 * 0.2 = 1 slot.
    let (db, engine) = engine_with(limited(0.2)).await;
    let ctx = ctx();
    let options = TxOptions::default();

    db.reject(
        "begin",
        backend::Error::sql(1205, "HY000", "Lock wait timeout exceeded"),
        Some(1),
    );

    assert!(engine.begin(&ctx, &options, &[]).await.is_err());
    assert_eq!(engine.tx_pool().scp().size(), 0);
    assert_eq!(engine.tx_pool().limiter().usage(&ctx.caller), 0);

    let (id, _) = engine.begin(&ctx, &options, &[]).await.unwrap();
    engine.commit(&ctx, id).await.unwrap();
}

#[tokio::test]
async fn test_finished_transaction_lookup() {
    let (_db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine.rollback(&ctx, id).await.unwrap();

    let err = engine.commit(&ctx, id).await.unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with(&format!("transaction {}: ended at", id)));
    assert!(message.ends_with("(rollback)"));
    assert_eq!(err.code(), Code::Aborted);

    let err = engine.rollback(&ctx, 42).await.unwrap_err();
    assert_eq!(err.to_string(), "transaction 42: not found");
}

#[tokio::test]
async fn test_execute_records_writes() {
    let (_db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine.execute(&ctx, id, "select * from t", 0).await.unwrap();
    engine.execute(&ctx, id, "insert into t values (1)", 0).await.unwrap();
    engine.execute(&ctx, id, "update t set a = 2", 0).await.unwrap();

    let conn = engine.tx_pool().get_and_lock(id, "inspect").unwrap();
    assert_eq!(
        conn.tx_props().unwrap().queries,
        vec!["insert into t values (1)", "update t set a = 2"]
    );
    engine.tx_pool().scp().unlock(conn, false);

    engine.rollback(&ctx, id).await.unwrap();
}

#[tokio::test]
async fn test_reserve_and_renew() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine
        .reserve_begin(&ctx, &TxOptions::default(), &["set @a = 1".to_string()])
        .await
        .unwrap();

    // A transaction is already open on it.
    let err = engine
        .tx_pool()
        .begin(&ctx, &TxOptions::default(), false, Some(id), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NestedTransaction(nested) if nested == id));

    engine.execute(&ctx, id, "insert into t values (1)", 0).await.unwrap();
    let renewed = engine.commit(&ctx, id).await.unwrap().unwrap();
    assert_ne!(renewed, id);

    let err = engine.execute(&ctx, id, "select 1", 0).await.unwrap_err();
    assert!(err.to_string().ends_with(&format!("(renewed as {})", renewed)));

    // Still reserved, no transaction.
    engine.execute(&ctx, renewed, "select 1", 0).await.unwrap();
    engine.release(&ctx, renewed).await.unwrap();
    assert_eq!(engine.tx_pool().scp().size(), 0);

    assert_eq!(
        db.queries(),
        vec![
            "set @a = 1",
            "begin",
            "insert into t values (1)",
            "commit",
            "select 1"
        ]
    );
}

#[tokio::test]
async fn test_reserve_existing_transaction() {
    let (_db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    assert_eq!(engine.reserve(&ctx, Some(id), &[]).await.unwrap(), id);

    let renewed = engine.rollback(&ctx, id).await.unwrap();
    assert!(renewed.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_kills_idle_transaction() {
    let mut config = limited(0.2);
    config.tx_pool.timeout = 1_000;
    let (db, engine) = engine_with(config).await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;

    let err = engine.commit(&ctx, id).await.unwrap_err();
    assert!(err.to_string().contains("exceeded timeout: 1s"));
    assert!(db.queries().contains(&"rollback".to_string()));

    let counts = engine.env().stats().counts();
    assert_eq!(counts.transaction_kills, 1);

    // The limiter slot came back.
    assert_eq!(engine.tx_pool().limiter().usage(&ctx.caller), 0);
    assert!(engine.begin(&ctx, &TxOptions::default(), &[]).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_kills_reserved() {
    let mut config = config();
    config.tx_pool.timeout = 1_000;
    let (_db, engine) = engine_with(config).await;
    let ctx = ctx();

    let id = engine.reserve(&ctx, None, &[]).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;

    assert!(engine.execute(&ctx, id, "select 1", 0).await.is_err());
    assert_eq!(engine.env().stats().counts().reserved_kills, 1);
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test]
async fn test_lost_connection_ends_transaction() {
    let (db, engine) = engine_with(limited(0.2)).await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    db.reject(
        "insert into t values (1)",
        backend::Error::sql(2013, "HY000", "Lost connection to MySQL server during query"),
        Some(1),
    );

    // No retry inside a transaction.
    assert!(engine
        .execute(&ctx, id, "insert into t values (1)", 0)
        .await
        .is_err());
    assert_eq!(db.count("insert into t values (1)"), 1);

    let err = engine.commit(&ctx, id).await.unwrap_err();
    assert!(err.to_string().ends_with("(unlocked closed connection)"));
    assert_eq!(engine.tx_pool().limiter().usage(&ctx.caller), 0);
}

#[tokio::test]
async fn test_close_rolls_back() {
    let (db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine.close().await;

    assert_eq!(engine.state(), State::NotServing);
    assert_eq!(db.queries(), vec!["begin", "rollback"]);
    assert!(engine.commit(&ctx, id).await.is_err());
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_with_transaction_in_flight() {
    let (_db, engine) = engine().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    let conn = engine.tx_pool().get_and_lock(id, "in flight").unwrap();

    let close = {
        let engine = engine.clone();
        spawn(async move { engine.close().await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!close.is_finished());

    // Comes back after the forced rollback and is closed instead of kept.
    engine.tx_pool().scp().unlock(conn, true);
    tokio::time::timeout(Duration::from_secs(5), close)
        .await
        .expect("close finished")
        .unwrap();

    assert_eq!(engine.state(), State::NotServing);
    assert_eq!(engine.tx_pool().scp().size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_transition() {
    let (db, engine) = engine().await;
    engine.accept_read_only().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();

    let transition = {
        let engine = engine.clone();
        spawn(async move { engine.accept_read_write().await })
    };

    while engine.state() != State::Transitioning {
        yield_now().await;
    }

    // No new transactions while transitioning, but open ones can finish.
    assert!(engine.begin(&ctx, &TxOptions::default(), &[]).await.is_err());
    engine.commit(&ctx, id).await.unwrap();

    transition.await.unwrap();
    assert_eq!(engine.state(), State::AcceptingReadAndWrite);
    assert_eq!(db.queries(), vec!["start transaction read only", "commit"]);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expires() {
    let (db, engine) = engine().await;
    engine.accept_read_only().await;
    let ctx = ctx();

    let (id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    engine.accept_read_write().await;

    assert_eq!(engine.state(), State::AcceptingReadAndWrite);
    assert_eq!(db.queries(), vec!["start transaction read only", "rollback"]);
    assert!(engine.commit(&ctx, id).await.is_err());
}

#[tokio::test]
async fn test_engine_state() {
    let (_db, engine) = engine().await;
    let ctx = ctx();

    let (_id, _) = engine.begin(&ctx, &TxOptions::default(), &[]).await.unwrap();
    let state = engine.engine_state();

    assert_eq!(state.state, "AcceptingReadAndWrite");
    assert_eq!(state.connections, 1);
    assert_eq!(state.prepared, 0);
    assert_eq!(state.counts.begins, 1);
}
