//! TTL eviction and capacity policies exercised through the wire.

mod common;

use clasp_core::{ErrorKind, Message, Set, Value};
use clasp_router::{EvictionStrategy, Router, RouterConfig};
use common::{settle, TestClient};
use std::time::Duration;

#[tokio::test]
async fn ttl_eviction_is_silent_and_revision_resumes() {
    let router = Router::new(RouterConfig {
        param_ttl_secs: 1,
        ttl_sweep_secs: 1,
        ..Default::default()
    })
    .unwrap();

    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/ephemeral/**").await;

    let mut writer = TestClient::connect(&router, "writer").await;
    writer.set("/ephemeral/x", 1i64).await;
    assert_eq!(sub.expect_value().await.revision, 1);
    writer.set("/ephemeral/x", 2i64).await;
    assert_eq!(sub.expect_value().await.revision, 2);

    // Idle past the TTL plus a sweep period
    tokio::time::sleep(Duration::from_millis(2600)).await;

    // Eviction produced no notification
    writer.get("/ephemeral/x").await;
    assert_eq!(
        writer.expect_error().await.code,
        ErrorKind::NotFound.code()
    );

    // Recreation resumes above the high-water mark: the subscriber never
    // observes a revision regression
    writer.set("/ephemeral/x", 3i64).await;
    let value = sub.expect_value().await;
    assert_eq!(value.value, Value::Int(3));
    assert!(value.revision > 2, "revision regressed to {}", value.revision);
}

#[tokio::test]
async fn no_ttl_disables_eviction() {
    let router = Router::new(RouterConfig {
        param_ttl_secs: 1,
        ttl_sweep_secs: 1,
        no_ttl: true,
        ..Default::default()
    })
    .unwrap();

    let mut writer = TestClient::connect(&router, "writer").await;
    writer.set("/sticky", 1i64).await;
    tokio::time::sleep(Duration::from_millis(2200)).await;
    writer.get("/sticky").await;
    assert_eq!(writer.expect_value().await.value, Value::Int(1));
}

#[tokio::test]
async fn reject_new_at_capacity() {
    let router = Router::new(RouterConfig {
        max_params: 2,
        eviction: EvictionStrategy::RejectNew,
        ..Default::default()
    })
    .unwrap();

    let mut writer = TestClient::connect(&router, "writer").await;
    writer.set("/cap/a", 1i64).await;
    writer.set("/cap/b", 2i64).await;

    writer.send(&Message::Set(Set::new("/cap/c", 3i64))).await;
    let err = writer.expect_error().await;
    assert_eq!(err.code, ErrorKind::AtCapacity.code());

    // Updates to existing addresses still pass
    let ack = writer.set("/cap/a", 10i64).await;
    assert_eq!(ack.revision, Some(2));
}

#[tokio::test]
async fn lru_eviction_makes_room() {
    let router = Router::new(RouterConfig {
        max_params: 2,
        eviction: EvictionStrategy::Lru,
        ..Default::default()
    })
    .unwrap();

    let mut writer = TestClient::connect(&router, "writer").await;
    writer.set("/cap/a", 1i64).await;
    writer.set("/cap/b", 2i64).await;
    // Touch /cap/a so /cap/b is the LRU victim
    writer.get("/cap/a").await;
    writer.expect_value().await;

    writer.set("/cap/c", 3i64).await;
    settle().await;

    writer.get("/cap/b").await;
    assert_eq!(
        writer.expect_error().await.code,
        ErrorKind::NotFound.code()
    );
    writer.get("/cap/a").await;
    assert_eq!(writer.expect_value().await.value, Value::Int(1));
    assert_eq!(router.param_count(), 2);
}
