//! End-to-end tests against a live PostgreSQL server.
//!
//! Ignored by default since they need a reachable server: set `DATABASE_URL`
//! (defaults to `postgres://localhost/postgres`) and run with
//! `cargo test -- --ignored`.

use std::cell::RefCell;
use std::env;
use std::rc::Rc;

use pg_engine::engine::pool::{PoolCollaborator, WeakEngine};
use pg_engine::{ConnectionUri, Engine};

struct RecordingPool {
    ready_count: RefCell<u32>,
}

impl RecordingPool {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            ready_count: RefCell::new(0),
        })
    }
}

impl PoolCollaborator for RecordingPool {
    fn engine_ready(&self, _engine: WeakEngine) {
        *self.ready_count.borrow_mut() += 1;
    }

    fn engine_disconnected(&self, _engine: WeakEngine) {}

    fn notification(&self, _engine: WeakEngine, _channel: &str, _payload: &str) {}
}

fn database_url() -> String {
    let mut url = env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/postgres".to_string());
    if !url.contains("sslmode=") {
        url.push_str(if url.contains('?') { "&sslmode=disable" } else { "?sslmode=disable" });
    }
    url
}

async fn connected_engine() -> (Engine, Rc<RecordingPool>) {
    let uri: ConnectionUri = database_url().as_str().try_into().expect("valid connection url");
    let engine = Engine::new(uri, Rc::new(pg_engine::env::ProcessEnvironment));
    let pool = RecordingPool::new();
    engine.connect(pool.clone()).await.expect("connect to test server");
    (engine, pool)
}

#[tokio::test(flavor = "current_thread")]
#[ignore = "requires a reachable postgres server"]
async fn simple_query_round_trip() {
    let (engine, pool) = connected_engine().await;

    let handle = engine.simple_query("select 1 as n").await.unwrap();
    let mut rows = handle.rows;
    let row = rows.recv().await.expect("one row");
    assert_eq!(row.get_str(0), Some("1"));
    assert!(rows.recv().await.is_none());

    let status = handle.completed.await.unwrap().unwrap();
    assert_eq!(status.tag, "SELECT 1");
    assert_eq!(*pool.ready_count.borrow(), 1);
}

#[tokio::test(flavor = "current_thread")]
#[ignore = "requires a reachable postgres server"]
async fn extended_query_binds_parameters() {
    let (engine, _pool) = connected_engine().await;

    let handle = engine
        .handle_query("select $1::int + $2::int", vec![Some(b"2".to_vec()), Some(b"3".to_vec())], None)
        .await
        .unwrap();
    let mut rows = handle.rows;
    let row = rows.recv().await.expect("one row");
    assert_eq!(row.get_str(0), Some("5"));

    handle.completed.await.unwrap().unwrap();
}

#[tokio::test(flavor = "current_thread")]
#[ignore = "requires a reachable postgres server"]
async fn bad_sql_surfaces_a_server_error() {
    let (engine, _pool) = connected_engine().await;

    let handle = engine.simple_query("select * from no_such_table_at_all").await.unwrap();
    let err = handle.completed.await.unwrap().unwrap_err();
    assert!(err.sqlstate().is_some());
}

#[tokio::test(flavor = "current_thread")]
#[ignore = "requires a reachable postgres server"]
async fn a_second_query_while_busy_is_rejected() {
    let (engine, _pool) = connected_engine().await;
    let engine2 = engine.clone();

    // Run a slow query and, while it's still in flight, start a second one
    // on the same engine: the `query_active` guard must reject it.
    let (first, second) = tokio::join!(
        async { engine.simple_query("select pg_sleep(0.2)").await },
        async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            engine2.simple_query("select 1").await
        }
    );

    first.unwrap().completed.await.unwrap().unwrap();
    assert!(matches!(second, Err(pg_engine::Error::Busy)));
}

#[tokio::test(flavor = "current_thread")]
#[ignore = "requires a reachable postgres server"]
async fn insert_update_delete_report_rows_affected() {
    let (engine, _pool) = connected_engine().await;

    for stmt in [
        "drop table if exists engine_integration_tmp",
        "create table engine_integration_tmp (id int primary key, value text)",
    ] {
        let handle = engine.simple_query(stmt).await.unwrap();
        handle.completed.await.unwrap().unwrap();
    }

    let insert = engine
        .handle_query(
            "insert into engine_integration_tmp (id, value) values ($1, $2)",
            vec![Some(b"1".to_vec()), Some(b"hello".to_vec())],
            None,
        )
        .await
        .unwrap();
    let status = insert.completed.await.unwrap().unwrap();
    assert_eq!(status.rows_affected, Some(1));

    let update = engine.simple_query("update engine_integration_tmp set value = 'bye'").await.unwrap();
    let status = update.completed.await.unwrap().unwrap();
    assert_eq!(status.rows_affected, Some(1));

    let cleanup = engine.simple_query("drop table engine_integration_tmp").await.unwrap();
    cleanup.completed.await.unwrap().unwrap();
}
