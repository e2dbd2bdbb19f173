//! Conn and Pool tests over real sockets against a single stub node.

mod common;

use common::StubCluster;
use futures_util::future::join_all;
use redshard::{
    dial, Cmd, Connector, DialConfig, Error, OnEmpty, Pipeline, Pool, PoolConfig, TcpConnector,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn dialed_conn_set_get_round_trip() {
    let stub = StubCluster::start(1).await;
    let conn = dial(&stub.addr_of(0), &DialConfig::default()).await.unwrap();

    let reply = conn
        .run_command(None, &Cmd::new("SET").key("foo").arg("a"))
        .await
        .unwrap();
    assert_eq!(reply.as_str().unwrap(), "OK");

    let reply = conn
        .run_command(None, &Cmd::new("GET").key("foo"))
        .await
        .unwrap();
    assert_eq!(reply.as_str().unwrap(), "a");

    conn.close();
}

#[tokio::test]
async fn pipelined_set_then_get_sees_the_write() {
    let stub = StubCluster::start(1).await;
    let conn = dial(&stub.addr_of(0), &DialConfig::default()).await.unwrap();

    let pipe = Pipeline::new()
        .cmd(Cmd::new("SET").key("foo").arg("bar"))
        .cmd(Cmd::new("GET").key("foo"));
    let replies = conn.run_pipeline(None, &pipe).await.unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].as_str().unwrap(), "OK");
    assert_eq!(replies[1].as_str().unwrap(), "bar");

    conn.close();
}

#[tokio::test]
async fn pool_conserves_connections_under_load() {
    let stub = StubCluster::start(1).await;
    let pool = Pool::new(
        stub.addr_of(0),
        Arc::new(TcpConnector::default()) as Arc<dyn Connector>,
        PoolConfig::default().with_size(2).with_on_empty(OnEmpty::Wait),
    )
    .await
    .unwrap();
    assert_eq!(pool.num_avail_conns(), 2);

    let calls = (0..40).map(|i| {
        let pool = pool.clone();
        async move {
            let arg = format!("msg-{i}");
            let reply = pool
                .run_command(None, &Cmd::new("ECHO").arg(arg.clone()))
                .await
                .unwrap();
            assert_eq!(reply.as_str().unwrap(), arg);
        }
    });
    join_all(calls).await;

    assert_eq!(pool.num_avail_conns(), 2);
    pool.close().await;
    assert_eq!(pool.num_avail_conns(), 0);
}

#[tokio::test]
async fn empty_pool_deadline_is_respected() {
    let stub = StubCluster::start(1).await;
    let pool = Pool::new(
        stub.addr_of(0),
        Arc::new(TcpConnector::default()) as Arc<dyn Connector>,
        PoolConfig::default()
            .with_size(0)
            .with_on_empty(OnEmpty::ErrAfter(Duration::from_secs(1))),
    )
    .await
    .unwrap();

    let started = Instant::now();
    let err = pool.get().await.unwrap_err();
    let took = started.elapsed();
    assert!(matches!(err, Error::PoolEmpty));
    assert!(took >= Duration::from_secs(1), "returned early: {took:?}");
    assert!(
        took < Duration::from_millis(1500),
        "returned far too late: {took:?}"
    );
    pool.close().await;
}
