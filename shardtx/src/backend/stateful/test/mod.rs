use std::time::Duration;

use tokio::time::sleep;

use crate::backend::MemoryDb;
use crate::context::{Caller, Context};
use crate::test::{env, memory_connector};

use super::*;

fn pool() -> (MemoryDb, StatefulConnectionPool) {
    let env = env();
    let (db, connector) = memory_connector();
    let pool = StatefulConnectionPool::new(&env);
    pool.open(&connector);
    (db, pool)
}

fn tx(caller: &Caller) -> TxProperties {
    TxProperties::new(caller, false, false)
}

#[tokio::test]
async fn test_lock_and_unlock() {
    let (_db, pool) = pool();
    let ctx = Context::default();

    let conn = pool.new_conn(&ctx, false).await.unwrap();
    let id = conn.id();
    assert_eq!(pool.size(), 1);

    let err = pool.get_and_lock(id, "for query").unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("transaction {}: in use: new connection", id)
    );

    pool.unlock(conn, true);
    let conn = pool.get_and_lock(id, "for query").unwrap();
    let err = pool.get_and_lock(id, "for commit").unwrap_err();
    assert!(err.to_string().ends_with("in use: for query"));

    pool.release(conn, "done");
    let err = pool.get_and_lock(id, "for query").unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with(&format!("transaction {}: ended at ", id)));
    assert!(message.ends_with("(done)"));
    assert_eq!(pool.size(), 0);

    let err = pool.get_and_lock(id + 100, "for query").unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("transaction {}: not found", id + 100)
    );
}

#[tokio::test]
async fn test_ids_increase() {
    let (_db, pool) = pool();
    let ctx = Context::default();

    let a = pool.new_conn(&ctx, false).await.unwrap();
    let b = pool.new_conn(&ctx, false).await.unwrap();
    assert!(b.id() > a.id());

    pool.adjust_last_id(b.id() + 1000);
    let c = pool.new_conn(&ctx, false).await.unwrap();
    assert_eq!(c.id(), b.id() + 1001);

    // Lower values don't move it back.
    pool.adjust_last_id(1);
    let d = pool.new_conn(&ctx, false).await.unwrap();
    assert_eq!(d.id(), c.id() + 1);
}

#[tokio::test]
async fn test_found_rows_pool() {
    let (db, pool) = pool();
    let ctx = Context::default();

    let _plain = pool.new_conn(&ctx, false).await.unwrap();
    let _found = pool.new_conn(&ctx, true).await.unwrap();

    let found_rows: Vec<_> = db
        .connections()
        .into_iter()
        .filter(|params| params.user == "shardtx")
        .map(|params| params.found_rows)
        .collect();
    assert_eq!(found_rows, vec![false, true]);
}

#[tokio::test]
async fn test_unlock_closed_releases() {
    let (_db, pool) = pool();
    let ctx = Context::default();

    let mut conn = pool.new_conn(&ctx, false).await.unwrap();
    let id = conn.id();
    conn.close();
    pool.unlock(conn, true);

    let err = pool.get_and_lock(id, "for query").unwrap_err();
    assert!(err.to_string().ends_with("(unlocked closed connection)"));
}

#[tokio::test]
async fn test_shutdown_non_tx() {
    let (_db, pool) = pool();
    let ctx = Context::default();
    let caller = Caller::new("app", "localhost");

    let idle = pool.new_conn(&ctx, false).await.unwrap();
    let mut in_tx = pool.new_conn(&ctx, false).await.unwrap();
    in_tx.set_tx_props(tx(&caller));
    let busy = pool.new_conn(&ctx, false).await.unwrap();
    let (idle_id, tx_id, busy_id) = (idle.id(), in_tx.id(), busy.id());

    pool.unlock(idle, true);
    pool.unlock(in_tx, true);
    pool.shutdown_non_tx();

    assert!(pool.get_and_lock(idle_id, "for query").is_err());
    let in_tx = pool.get_and_lock(tx_id, "for query").unwrap();
    pool.unlock(in_tx, true);

    // Locked during shutdown, released when it comes back.
    pool.unlock(busy, true);
    let err = pool.get_and_lock(busy_id, "for query").unwrap_err();
    assert!(err.to_string().ends_with("(pool is shut down)"));
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn test_shutdown_all() {
    let (_db, pool) = pool();
    let ctx = Context::default();

    let idle = pool.new_conn(&ctx, false).await.unwrap();
    let busy = pool.new_conn(&ctx, false).await.unwrap();
    let idle_id = idle.id();
    pool.unlock(idle, true);

    let conns = pool.shutdown_all();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].id(), idle_id);

    pool.unlock(busy, true);
    assert_eq!(pool.size(), 1);

    for conn in conns {
        pool.release(conn, "rolled back");
    }
    pool.wait_for_empty().await;
    assert_eq!(pool.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_outdated() {
    let (_db, pool) = pool();
    let ctx = Context::default();

    let old = pool.new_conn(&ctx, false).await.unwrap();
    let old_id = old.id();
    pool.unlock(old, true);

    sleep(Duration::from_millis(200)).await;

    let fresh = pool.new_conn(&ctx, false).await.unwrap();
    pool.unlock(fresh, true);

    let outdated = pool.get_outdated(Duration::from_millis(100), "for sweep");
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].id(), old_id);

    let err = pool.get_and_lock(old_id, "for query").unwrap_err();
    assert!(err.to_string().ends_with("in use: for sweep"));
}

#[tokio::test]
async fn test_renew() {
    let (_db, pool) = pool();
    let ctx = Context::default();
    let caller = Caller::new("app", "localhost");

    let mut conn = pool.new_conn(&ctx, false).await.unwrap();
    let old = conn.id();
    assert!(matches!(pool.renew(&mut conn), Err(Error::NotTainted(_))));

    conn.taint(&caller);
    assert!(conn.is_tainted());
    assert_eq!(conn.caller(), Some(&caller));

    pool.renew(&mut conn).unwrap();
    assert_ne!(conn.id(), old);
    assert_eq!(pool.size(), 1);

    let err = pool.get_and_lock(old, "for query").unwrap_err();
    assert!(err
        .to_string()
        .ends_with(&format!("(renewed as {})", conn.id())));

    pool.unlock(conn, true);
}

#[tokio::test]
async fn test_aborted_connection() {
    let (_db, pool) = pool();
    let ctx = Context::default();
    let caller = Caller::new("app", "localhost");

    let mut conn = pool.new_conn(&ctx, false).await.unwrap();
    conn.exec(&ctx, "select 1", 1).await.unwrap();
    conn.close();
    assert!(matches!(
        conn.exec(&ctx, "select 1", 1).await,
        Err(crate::backend::Error::ConnectionAborted)
    ));

    conn.set_tx_props(tx(&caller));
    if let Some(props) = conn.tx_props_mut() {
        props.conclusion = Some(Conclusion::Kill);
    }
    let err = conn.exec(&ctx, "select 1", 1).await.unwrap_err();
    assert_eq!(err.to_string(), "transaction was aborted: kill");

    pool.release(conn, "test");
}

#[tokio::test]
async fn test_kill() {
    let (db, pool) = pool();
    let ctx = Context::default();

    let mut conn = pool.new_conn(&ctx, false).await.unwrap();
    let conn_id = conn.conn_id();
    conn.kill("test", Duration::from_secs(1)).await.unwrap();

    assert!(conn.is_closed());
    assert_eq!(db.killed(), vec![conn_id]);

    let err = conn.exec(&ctx, "select 1", 1).await.unwrap_err();
    assert!(err.to_string().contains("(errno 2013)"));
    assert!(err.to_string().contains("due to test"));

    pool.release(conn, "test");
}

#[tokio::test]
async fn test_record_queries() {
    let (_db, pool) = pool();
    let ctx = Context::default();
    let caller = Caller::new("app", "localhost");

    let mut conn = pool.new_conn(&ctx, false).await.unwrap();
    conn.record_query("ignored");
    conn.set_tx_props(tx(&caller));
    conn.record_query("insert into t values (1)");

    let props = conn.take_tx_props().unwrap();
    assert_eq!(props.queries, vec!["insert into t values (1)".to_string()]);
    assert!(!conn.is_in_transaction());

    pool.release(conn, "test");
}

#[tokio::test]
async fn test_shutdown_mode_never_relaxes() {
    let (_db, pool) = pool();
    let ctx = Context::default();
    let caller = Caller::new("app", "localhost");

    let mut in_tx = pool.new_conn(&ctx, false).await.unwrap();
    in_tx.set_tx_props(tx(&caller));
    let id = in_tx.id();

    let idle = pool.shutdown_all();
    assert!(idle.is_empty());
    pool.shutdown_non_tx();

    // Still a full shutdown: the transaction is closed, not put back.
    pool.unlock(in_tx, true);
    assert_eq!(pool.size(), 0);
    let err = pool.get_and_lock(id, "for query").unwrap_err();
    assert!(err.to_string().ends_with("(pool is shut down)"));
    pool.wait_for_empty().await;
}
