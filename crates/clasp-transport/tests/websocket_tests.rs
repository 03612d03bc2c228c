//! WebSocket loopback tests

#![cfg(feature = "websocket")]

use bytes::Bytes;
use clasp_transport::{connect_ws, ConnEvent, Listener, TransportOptions, WsListener};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn frame_roundtrip_over_loopback() {
    let mut listener = WsListener::bind("127.0.0.1:0", TransportOptions::default())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.unwrap();
        match accepted.source.recv().await {
            Some(ConnEvent::Frame(f)) => {
                accepted.sink.send(f).await.unwrap();
            }
            other => panic!("expected frame, got {other:?}"),
        }
    });

    let (sink, mut source) = connect_ws(&format!("ws://{addr}"), TransportOptions::default())
        .await
        .unwrap();

    sink.send(Bytes::from_static(b"echo me")).await.unwrap();

    let event = timeout(Duration::from_secs(2), source.recv())
        .await
        .expect("echo within deadline");
    match event {
        Some(ConnEvent::Frame(f)) => assert_eq!(f.as_ref(), b"echo me"),
        other => panic!("expected frame, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn oversize_frame_closes_connection() {
    let mut listener = WsListener::bind(
        "127.0.0.1:0",
        TransportOptions { max_frame: 64 },
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.unwrap();
        accepted.source.recv().await
    });

    let (sink, _source) = connect_ws(&format!("ws://{addr}"), TransportOptions::default())
        .await
        .unwrap();
    sink.send(Bytes::from(vec![0u8; 1024])).await.unwrap();

    let event = timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Some(ConnEvent::Closed(Some(_)))));
}
