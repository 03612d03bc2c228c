//! Gesture routing and move coalescing through the router.

mod common;

use clasp_core::{GesturePhase, Message, Publish, SignalKind, Value};
use clasp_router::{Router, RouterConfig};
use common::TestClient;
use std::time::Duration;

fn gesture(address: &str, id: u32, phase: GesturePhase, v: f64) -> Message {
    Message::Publish(Publish {
        address: address.to_string(),
        signal: SignalKind::Gesture,
        payload: Some(Value::Float(v)),
        qos: Some(0),
        timestamp: None,
        gesture_id: Some(id),
        phase: Some(phase),
        keyframes: None,
        loop_: false,
        start_time: None,
    })
}

/// Long coalesce interval so flushing is driven by phase changes, not the
/// timer, keeping the test deterministic.
fn slow_coalesce_router() -> Router {
    Router::new(RouterConfig {
        gesture_coalesce_ms: 1000,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn moves_collapse_between_start_and_end() {
    let router = slow_coalesce_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/pad/**").await;

    let publisher = TestClient::connect(&router, "pub").await;
    publisher
        .send(&gesture("/pad/1", 7, GesturePhase::Start, 0.0))
        .await;
    for v in [0.1, 0.2, 0.3, 0.4] {
        publisher.send(&gesture("/pad/1", 7, GesturePhase::Move, v)).await;
    }
    publisher
        .send(&gesture("/pad/1", 7, GesturePhase::End, 1.0))
        .await;

    // Start, the latest buffered move, then End
    let start = sub.expect_publish().await;
    assert_eq!(start.phase, Some(GesturePhase::Start));

    let mv = sub.expect_publish().await;
    assert_eq!(mv.phase, Some(GesturePhase::Move));
    assert_eq!(mv.payload, Some(Value::Float(0.4)));

    let end = sub.expect_publish().await;
    assert_eq!(end.phase, Some(GesturePhase::End));
    assert_eq!(end.payload, Some(Value::Float(1.0)));

    assert!(sub.silent_for(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn cancel_also_flushes() {
    let router = slow_coalesce_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/pad/**").await;

    let publisher = TestClient::connect(&router, "pub").await;
    publisher
        .send(&gesture("/pad/1", 1, GesturePhase::Start, 0.0))
        .await;
    publisher
        .send(&gesture("/pad/1", 1, GesturePhase::Move, 0.5))
        .await;
    publisher
        .send(&gesture("/pad/1", 1, GesturePhase::Cancel, 0.0))
        .await;

    let phases: Vec<_> = [
        sub.expect_publish().await.phase,
        sub.expect_publish().await.phase,
        sub.expect_publish().await.phase,
    ]
    .into_iter()
    .flatten()
    .collect();
    assert_eq!(
        phases,
        vec![GesturePhase::Start, GesturePhase::Move, GesturePhase::Cancel]
    );
}

#[tokio::test]
async fn timer_flush_delivers_buffered_move() {
    let router = Router::new(RouterConfig {
        gesture_coalesce_ms: 30,
        ..Default::default()
    })
    .unwrap();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/pad/**").await;

    let publisher = TestClient::connect(&router, "pub").await;
    publisher
        .send(&gesture("/pad/1", 1, GesturePhase::Start, 0.0))
        .await;
    publisher
        .send(&gesture("/pad/1", 1, GesturePhase::Move, 0.7))
        .await;

    assert_eq!(sub.expect_publish().await.phase, Some(GesturePhase::Start));
    // No End arrives; the interval timer flushes the buffered move
    let mv = sub.expect_publish().await;
    assert_eq!(mv.phase, Some(GesturePhase::Move));
    assert_eq!(mv.payload, Some(Value::Float(0.7)));
}

#[tokio::test]
async fn concurrent_gesture_ids_stay_separate() {
    let router = slow_coalesce_router();
    let mut sub = TestClient::connect(&router, "sub").await;
    sub.subscribe(1, "/pad/**").await;

    let publisher = TestClient::connect(&router, "pub").await;
    for id in [1u32, 2u32] {
        publisher
            .send(&gesture("/pad/multi", id, GesturePhase::Start, 0.0))
            .await;
    }
    publisher
        .send(&gesture("/pad/multi", 1, GesturePhase::Move, 0.1))
        .await;
    publisher
        .send(&gesture("/pad/multi", 2, GesturePhase::Move, 0.2))
        .await;
    for id in [1u32, 2u32] {
        publisher
            .send(&gesture("/pad/multi", id, GesturePhase::End, 1.0))
            .await;
    }

    let mut events = Vec::new();
    for _ in 0..6 {
        let p = sub.expect_publish().await;
        events.push((p.gesture_id.unwrap(), p.phase.unwrap()));
    }
    assert_eq!(
        events
            .iter()
            .filter(|(_, ph)| *ph == GesturePhase::Move)
            .count(),
        2
    );
    assert_eq!(
        events
            .iter()
            .filter(|(_, ph)| *ph == GesturePhase::End)
            .count(),
        2
    );
}
