//! Integration tests against a real Redis Cluster.
//!
//! These tests require a Redis Cluster running on localhost.
//! All tests are marked with #[ignore] by default.
//!
//! Setup with Docker:
//! ```bash
//! docker run -d --name redis-cluster \
//!   -p 7000-7005:7000-7005 \
//!   grokzen/redis-cluster:latest
//! ```
//!
//! Run tests:
//! ```bash
//! cargo test --test cluster_integration -- --ignored
//! ```

use std::time::Duration;

use bytes::Bytes;
use slotlink::{command, key_slot, Cluster, Error, Frame, RetryConn, SLOT_COUNT};

/// Creates a cluster handle with a loaded slot mapping.
async fn create_test_cluster() -> Cluster {
    let cluster = Cluster::new(["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"])
        .expect("valid startup nodes");
    cluster.refresh().await.expect("failed to load topology");
    cluster
}

async fn retrying(cluster: &Cluster, keys: &[&str]) -> RetryConn {
    let mut conn = cluster.get().expect("cluster open");
    conn.bind(keys.iter().copied()).await.expect("bind failed");
    RetryConn::new(conn, 5, Duration::from_millis(100)).expect("valid retry settings")
}

#[tokio::test]
#[ignore]
async fn test_cluster_refresh_covers_all_slots() {
    let cluster = create_test_cluster().await;

    let mapping = cluster.mapping_snapshot().await;
    assert_eq!(mapping.len(), SLOT_COUNT as usize);
    assert!(
        mapping.iter().all(|addresses| !addresses.is_empty()),
        "cluster should cover all 16384 slots"
    );
}

#[tokio::test]
#[ignore]
async fn test_cluster_basic_operations() {
    let cluster = create_test_cluster().await;
    let key = "integration:test:basic";
    let mut conn = retrying(&cluster, &[key]).await;

    let reply = conn
        .execute(&command::set(key, "Hello, Cluster!"))
        .await
        .expect("SET failed");
    assert_eq!(reply, Frame::SimpleString(b"OK".to_vec()));

    let reply = conn.execute(&command::get(key)).await.expect("GET failed");
    assert_eq!(reply, Frame::BulkString(Some(Bytes::from("Hello, Cluster!"))));

    let reply = conn.execute(&command::del(key)).await.expect("DEL failed");
    assert_eq!(reply, Frame::Integer(1));

    let reply = conn.execute(&command::get(key)).await.expect("GET failed");
    assert!(reply.is_null());
}

#[tokio::test]
#[ignore]
async fn test_cluster_hash_tags() {
    let cluster = create_test_cluster().await;
    let keys = ["user:{12345}:name", "user:{12345}:email", "user:{12345}:age"];
    let mut conn = retrying(&cluster, &keys).await;
    assert_eq!(conn.get_ref().bound_slot(), Some(key_slot("12345")));

    for (i, key) in keys.iter().enumerate() {
        conn.execute(&command::set(*key, format!("value_{i}")))
            .await
            .expect("SET with hash tag failed");
    }

    let reply = conn
        .execute(&command::mget(keys))
        .await
        .expect("MGET failed");
    let values = reply.as_array().expect("MGET returns an array");
    assert_eq!(values.len(), 3);
    assert_eq!(values[2].as_str(), Some("value_2"));

    for key in keys {
        conn.execute(&command::del(key)).await.expect("DEL failed");
    }
}

#[tokio::test]
#[ignore]
async fn test_cluster_cross_slot_bind() {
    let cluster = create_test_cluster().await;
    let mut conn = cluster.get().expect("cluster open");

    let err = conn.bind(["test:key:1", "test:key:2"]).await.unwrap_err();
    assert!(matches!(err, Error::CrossSlot));
}

#[tokio::test]
#[ignore]
async fn test_cluster_unbound_key_gets_moved() {
    let cluster = create_test_cluster().await;

    // Find a key that the first mapped node does not own.
    let mapping = cluster.mapping_snapshot().await;
    let first = mapping[0][0].clone();
    let key = (0..1000)
        .map(|i| format!("moved:probe:{i}"))
        .find(|key| mapping[key_slot(key) as usize][0] != first)
        .expect("a key owned by another node");

    let mut plain = cluster.get().expect("cluster open");
    let err = plain.execute(&command::get(key.clone())).await.unwrap_err();
    assert!(matches!(err, Error::Moved { .. }));

    let mut conn = cluster.get().expect("cluster open");
    conn.bind([key.as_str()]).await.expect("bind failed");
    let mut conn = RetryConn::new(conn, 3, Duration::from_millis(100)).unwrap();
    conn.execute(&command::get(key)).await.expect("GET failed");
}

#[tokio::test]
#[ignore]
async fn test_cluster_topology_refresh_is_stable() {
    let cluster = create_test_cluster().await;
    let before = cluster.mapping_snapshot().await;

    cluster.refresh().await.expect("refresh failed");

    assert_eq!(before, cluster.mapping_snapshot().await);
}

#[tokio::test]
#[ignore]
async fn test_cluster_concurrent_operations() {
    let cluster = create_test_cluster().await;

    let mut handles = vec![];
    for i in 0..10 {
        let cluster = cluster.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("concurrent:test:{i}");
            let mut conn = retrying(&cluster, &[key.as_str()]).await;
            conn.execute(&command::set(key.clone(), format!("value_{i}")))
                .await?;
            let reply = conn.execute(&command::get(key.clone())).await?;
            conn.execute(&command::del(key)).await?;
            Ok::<_, Error>(reply)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.await.expect("task panicked").expect("operation failed");
        assert_eq!(reply.as_str(), Some(format!("value_{i}").as_str()));
    }

    let stats = cluster.stats().await;
    assert!(stats.values().all(|s| s.active == 0));
}

#[tokio::test]
#[ignore]
async fn test_cluster_large_value() {
    let cluster = create_test_cluster().await;
    let key = "integration:large";
    let value = Bytes::from(vec![b'x'; 1024 * 1024]);
    let mut conn = retrying(&cluster, &[key]).await;

    conn.execute(&command::set(key, value.clone()))
        .await
        .expect("SET failed");
    let reply = conn.execute(&command::get(key)).await.expect("GET failed");
    assert_eq!(reply.as_bytes(), Some(&value[..]));

    conn.execute(&command::del(key)).await.expect("DEL failed");
}

#[tokio::test]
#[ignore]
async fn test_cluster_close() {
    let cluster = create_test_cluster().await;
    cluster.close().await.expect("close failed");

    assert!(matches!(cluster.get(), Err(Error::ClusterClosed)));
    assert!(matches!(cluster.close().await, Err(Error::ClusterClosed)));
}
