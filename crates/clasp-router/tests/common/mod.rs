//! In-process test client speaking the wire protocol over the router's
//! mem transport.

#![allow(dead_code)]

use clasp_core::{
    codec, Ack, ErrorInfo, Get, Hello, Message, ParamSnapshot, Publish, Set, Snapshot, Subscribe,
    Unsubscribe, Value, PROTOCOL_VERSION,
};
use clasp_router::Router;
use clasp_transport::{BoxSource, ConnEvent, FrameSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const RECV_DEADLINE: Duration = Duration::from_secs(2);

pub struct TestClient {
    sink: Arc<dyn FrameSink>,
    source: BoxSource,
    pub session: String,
}

impl std::fmt::Debug for TestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClient")
            .field("session", &self.session)
            .finish()
    }
}

impl TestClient {
    pub async fn connect(router: &Router, name: &str) -> TestClient {
        Self::try_connect(router, name, None)
            .await
            .expect("handshake should succeed")
    }

    pub async fn try_connect(
        router: &Router,
        name: &str,
        token: Option<&str>,
    ) -> Result<TestClient, ErrorInfo> {
        let (sink, source) = router.connect_local().await.expect("local connect");
        let mut client = TestClient {
            sink,
            source,
            session: String::new(),
        };
        client
            .send(&Message::Hello(Hello {
                version: PROTOCOL_VERSION,
                name: name.to_string(),
                features: vec![],
                token: token.map(|t| t.to_string()),
            }))
            .await;
        match client.recv().await {
            Some(Message::Welcome(welcome)) => {
                client.session = welcome.session;
                Ok(client)
            }
            Some(Message::Error(e)) => Err(e),
            other => panic!("expected WELCOME or ERROR, got {other:?}"),
        }
    }

    pub async fn send(&self, message: &Message) {
        let bytes = codec::encode_payload(message).expect("encode");
        self.sink
            .send(bytes::Bytes::from(bytes))
            .await
            .expect("send");
    }

    /// Next decoded message, ignoring server pings. None on close/timeout.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match timeout(RECV_DEADLINE, self.source.recv()).await {
                Ok(Some(ConnEvent::Frame(payload))) => {
                    let msg = codec::decode_payload(&payload).expect("decodable frame");
                    if matches!(msg, Message::Ping) {
                        continue;
                    }
                    return Some(msg);
                }
                Ok(Some(ConnEvent::Closed(_))) | Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Next decoded message within `window`, ignoring pings; None on
    /// silence or close.
    pub async fn recv_within(&mut self, window: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.source.recv()).await {
                Ok(Some(ConnEvent::Frame(payload))) => {
                    let msg = codec::decode_payload(&payload).expect("decodable frame");
                    if matches!(msg, Message::Ping) {
                        continue;
                    }
                    return Some(msg);
                }
                Ok(Some(ConnEvent::Closed(_))) | Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }

    /// True when nothing arrives within `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        match timeout(window, self.source.recv()).await {
            Err(_) => true,
            Ok(Some(ConnEvent::Frame(payload))) => {
                let msg = codec::decode_payload(&payload).expect("decodable frame");
                panic!("expected silence, got {}", msg.type_name());
            }
            Ok(_) => true,
        }
    }

    pub async fn expect_ack(&mut self) -> Ack {
        loop {
            match self.recv().await {
                Some(Message::Ack(ack)) => return ack,
                Some(other) => {
                    let _ = other;
                }
                None => panic!("connection ended while waiting for ACK"),
            }
        }
    }

    pub async fn expect_error(&mut self) -> ErrorInfo {
        loop {
            match self.recv().await {
                Some(Message::Error(e)) => return e,
                Some(_) => {}
                None => panic!("connection ended while waiting for ERROR"),
            }
        }
    }

    pub async fn expect_value(&mut self) -> ParamSnapshot {
        loop {
            match self.recv().await {
                Some(Message::Value(v)) => return v,
                Some(_) => {}
                None => panic!("connection ended while waiting for VALUE"),
            }
        }
    }

    pub async fn expect_snapshot(&mut self) -> Snapshot {
        loop {
            match self.recv().await {
                Some(Message::Snapshot(s)) => return s,
                Some(_) => {}
                None => panic!("connection ended while waiting for SNAPSHOT"),
            }
        }
    }

    pub async fn expect_publish(&mut self) -> Publish {
        loop {
            match self.recv().await {
                Some(Message::Publish(p)) => return p,
                Some(_) => {}
                None => panic!("connection ended while waiting for PUBLISH"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Convenience operations
    // ------------------------------------------------------------------

    pub async fn set(&mut self, address: &str, value: impl Into<Value>) -> Ack {
        self.send(&Message::Set(Set::new(address, value))).await;
        self.expect_ack().await
    }

    pub async fn set_fire(&self, address: &str, value: impl Into<Value>) {
        self.send(&Message::Set(Set {
            qos: Some(0),
            ..Set::new(address, value)
        }))
        .await;
    }

    pub async fn get(&mut self, address: &str) {
        self.send(&Message::Get(Get {
            address: address.to_string(),
        }))
        .await;
    }

    /// Subscribe and return the initial snapshot.
    pub async fn subscribe(&mut self, id: u32, pattern: &str) -> Snapshot {
        self.subscribe_with(id, pattern, None, None).await
    }

    pub async fn subscribe_with(
        &mut self,
        id: u32,
        pattern: &str,
        max_rate: Option<u32>,
        epsilon: Option<f64>,
    ) -> Snapshot {
        self.send(&Message::Subscribe(Subscribe {
            id,
            pattern: pattern.to_string(),
            max_rate,
            epsilon,
        }))
        .await;
        self.expect_snapshot().await
    }

    pub async fn unsubscribe(&self, id: u32) {
        self.send(&Message::Unsubscribe(Unsubscribe { id })).await;
    }

    pub async fn close(&self) {
        let _ = self.sink.close().await;
    }
}

/// A router on defaults suitable for tests (no TTL churn, fast slow-consumer
/// detection not needed).
pub fn test_router() -> Router {
    Router::new(clasp_router::RouterConfig {
        name: "test router".into(),
        ..Default::default()
    })
    .expect("router starts")
}

/// Let queued dispatcher work settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
