//! Bundle atomicity, scheduling, and cancellation.

mod common;

use clasp_core::{Bundle, ErrorKind, Message, Set, Unsubscribe, Value};
use clasp_router::{AuthMode, Router, RouterConfig};
use common::{settle, test_router, TestClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn bundle(id: Option<u32>, scheduled_time: Option<u64>, messages: Vec<Message>) -> Message {
    Message::Bundle(Bundle {
        id,
        scheduled_time,
        qos: None,
        messages,
    })
}

#[tokio::test]
async fn immediate_bundle_applies_all_and_acks() {
    let router = test_router();
    let mut client = TestClient::connect(&router, "c1").await;

    client
        .send(&bundle(
            Some(7),
            None,
            vec![
                Message::Set(Set::new("/a", 1i64)),
                Message::Set(Set::new("/b", 2i64)),
            ],
        ))
        .await;
    let ack = client.expect_ack().await;
    assert_eq!(ack.bundle_id, Some(7));

    client.get("/a").await;
    assert_eq!(client.expect_value().await.value, Value::Int(1));
    client.get("/b").await;
    assert_eq!(client.expect_value().await.value, Value::Int(2));
}

#[tokio::test]
async fn bundle_deliveries_are_adjacent() {
    let router = test_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/**").await;

    // Unrelated traffic before and after the bundle
    let mut writer = TestClient::connect(&router, "writer").await;
    writer.set("/noise/pre", 0i64).await;
    writer
        .send(&bundle(
            None,
            None,
            vec![
                Message::Set(Set::new("/bundle/a", 1i64)),
                Message::Set(Set::new("/bundle/b", 2i64)),
            ],
        ))
        .await;
    writer.expect_ack().await;
    writer.set("/noise/post", 0i64).await;

    let mut addresses = Vec::new();
    for _ in 0..4 {
        addresses.push(sub.expect_value().await.address);
    }
    // The two bundle effects sit next to each other, in bundle-body order
    assert_eq!(
        addresses,
        vec!["/noise/pre", "/bundle/a", "/bundle/b", "/noise/post"]
    );
}

#[tokio::test]
async fn bundle_same_address_writes_apply_in_order() {
    let router = test_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/x").await;

    let mut client = TestClient::connect(&router, "c1").await;
    client
        .send(&bundle(
            None,
            None,
            vec![
                Message::Set(Set::new("/x", 1i64)),
                Message::Set(Set::new("/x", 2i64)),
            ],
        ))
        .await;
    client.expect_ack().await;

    // Both revisions surface, adjacent and in bundle-body order
    let first = sub.expect_value().await;
    assert_eq!((first.value, first.revision), (Value::Int(1), 1));
    let second = sub.expect_value().await;
    assert_eq!((second.value, second.revision), (Value::Int(2), 2));

    client.get("/x").await;
    let value = client.expect_value().await;
    assert_eq!(value.value, Value::Int(2));
    assert_eq!(value.revision, 2);
}

#[tokio::test]
async fn bundle_same_address_strategy_conflict_applies_nothing() {
    let router = test_router();
    let mut client = TestClient::connect(&router, "c1").await;
    client
        .send(&Message::Set(Set {
            strategy: Some(clasp_core::ConflictStrategy::Max),
            ..Set::new("/hwm", 0.5)
        }))
        .await;
    client.expect_ack().await;

    // 0.6 improves on 0.5, but 0.55 does not improve on the 0.6 the first
    // inner write would leave behind; the whole bundle must reject
    client
        .send(&bundle(
            None,
            None,
            vec![
                Message::Set(Set::new("/hwm", 0.6)),
                Message::Set(Set::new("/hwm", 0.55)),
            ],
        ))
        .await;
    let err = client.expect_error().await;
    assert_eq!(err.code, ErrorKind::RevisionConflict.code());

    // The first inner write did not leak
    client.get("/hwm").await;
    let value = client.expect_value().await;
    assert_eq!(value.value, Value::Float(0.5));
    assert_eq!(value.revision, 1);
}

#[tokio::test]
async fn bundle_with_failed_precondition_applies_nothing() {
    let router = test_router();
    let mut client = TestClient::connect(&router, "c1").await;
    client.set("/exists", 1i64).await;

    client
        .send(&bundle(
            None,
            None,
            vec![
                Message::Set(Set::new("/fresh", 10i64)),
                Message::Set(Set {
                    revision: Some(99),
                    ..Set::new("/exists", 2i64)
                }),
            ],
        ))
        .await;
    let err = client.expect_error().await;
    assert_eq!(err.code, ErrorKind::RevisionConflict.code());

    // Neither inner effect is visible
    client.get("/fresh").await;
    assert_eq!(
        client.expect_error().await.code,
        ErrorKind::NotFound.code()
    );
    client.get("/exists").await;
    let value = client.expect_value().await;
    assert_eq!(value.value, Value::Int(1));
    assert_eq!(value.revision, 1);
}

#[tokio::test]
async fn bundle_requires_authorization_for_every_message() {
    let mut tokens = HashMap::new();
    tokens.insert(
        "cpsk_limited".to_string(),
        vec!["write:/mine/**".to_string(), "read:/**".to_string()],
    );
    let router = Router::with_hooks(
        RouterConfig {
            auth: AuthMode::TokenRequired,
            ..Default::default()
        },
        Arc::new(clasp_router::StaticTokenAuthorizer::new(tokens).unwrap()),
        None,
    )
    .unwrap();

    let mut client = TestClient::try_connect(&router, "limited", Some("cpsk_limited"))
        .await
        .unwrap();

    client
        .send(&bundle(
            None,
            None,
            vec![
                Message::Set(Set::new("/mine/a", 1i64)),
                Message::Set(Set::new("/theirs/b", 2i64)),
            ],
        ))
        .await;
    let err = client.expect_error().await;
    assert_eq!(err.code, ErrorKind::PermissionDenied.code());

    // The authorized half did not land either
    client.get("/mine/a").await;
    assert_eq!(
        client.expect_error().await.code,
        ErrorKind::NotFound.code()
    );
}

#[tokio::test]
async fn scheduled_bundle_executes_at_deadline() {
    let router = test_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/timed/**").await;

    let mut client = TestClient::connect(&router, "c1").await;

    // Schedule 300ms out, measured against server time from SYNC
    client
        .send(&Message::Sync(clasp_core::Sync {
            t1: 0,
            t2: None,
            t3: None,
        }))
        .await;
    let server_now = match client.recv().await {
        Some(Message::Sync(s)) => s.t3.unwrap(),
        other => panic!("expected SYNC, got {other:?}"),
    };

    let started = Instant::now();
    client
        .send(&bundle(
            Some(1),
            Some(server_now + 300_000),
            vec![Message::Set(Set::new("/timed/a", 1i64))],
        ))
        .await;

    let value = sub.expect_value().await;
    let elapsed = started.elapsed();
    assert_eq!(value.address, "/timed/a");
    assert!(
        elapsed >= Duration::from_millis(250),
        "fired early at {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(800),
        "fired late at {elapsed:?}"
    );

    // Execution acks to the owner
    let ack = client.expect_ack().await;
    assert_eq!(ack.bundle_id, Some(1));
}

#[tokio::test]
async fn scheduled_bundle_cancellation_is_idempotent() {
    let router = test_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/timed/**").await;

    let client = TestClient::connect(&router, "c1").await;
    let far = clasp_core::time::wall_now() + 400_000;
    client
        .send(&bundle(
            Some(9),
            Some(far),
            vec![Message::Set(Set::new("/timed/x", 1i64))],
        ))
        .await;
    settle().await;

    // Cancel twice; both are accepted silently
    client.send(&Message::Unsubscribe(Unsubscribe { id: 9 })).await;
    client.send(&Message::Unsubscribe(Unsubscribe { id: 9 })).await;

    assert!(sub.silent_for(Duration::from_millis(600)).await);
}

#[tokio::test]
async fn owner_disconnect_cancels_scheduled_bundles() {
    let router = test_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/timed/**").await;

    let client = TestClient::connect(&router, "doomed").await;
    let due = clasp_core::time::wall_now() + 300_000;
    client
        .send(&bundle(
            Some(3),
            Some(due),
            vec![Message::Set(Set::new("/timed/orphan", 1i64))],
        ))
        .await;
    settle().await;
    client.close().await;

    assert!(sub.silent_for(Duration::from_millis(500)).await);
}

#[tokio::test]
async fn far_future_schedule_is_rejected() {
    let router = test_router();
    let mut client = TestClient::connect(&router, "c1").await;

    let beyond = clasp_core::time::wall_now() + 48 * 3600 * 1_000_000;
    client
        .send(&bundle(
            None,
            Some(beyond),
            vec![Message::Set(Set::new("/later", 1i64))],
        ))
        .await;
    let err = client.expect_error().await;
    assert_eq!(err.code, ErrorKind::Unavailable.code());
}

#[tokio::test]
async fn bundle_rejects_non_write_messages() {
    let router = test_router();
    let mut client = TestClient::connect(&router, "c1").await;
    client
        .send(&bundle(
            None,
            None,
            vec![Message::Ping],
        ))
        .await;
    let err = client.expect_error().await;
    assert_eq!(err.code, ErrorKind::MalformedFrame.code());
}
