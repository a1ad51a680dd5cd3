//! Framed datagram channel over loopback.

use std::sync::Arc;
use std::time::Duration;

use natlink::{encode_frame, ChannelConfig, Datagram, FramedChannel, MAX_PAYLOAD};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn started() -> FramedChannel {
    let channel = FramedChannel::new(ChannelConfig {
        recv_timeout: Duration::from_millis(100),
        ..ChannelConfig::loopback()
    });
    assert!(channel.start().await, "loopback bind failed");
    channel
}

fn collect(channel: &FramedChannel, type_id: u32) -> mpsc::UnboundedReceiver<Datagram> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.add_listener(
        type_id,
        Arc::new(move |datagram: Datagram| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(datagram);
            }
        }),
    );
    rx
}

#[tokio::test]
async fn test_datagram_delivered_once_with_equal_bytes() {
    let receiver = started().await;
    let sender = started().await;
    let mut rx = collect(&receiver, 9);

    let payload: Vec<u8> = (0..=255u8).cycle().take(MAX_PAYLOAD).collect();
    assert!(sender.send(9, &payload, receiver.local_addr().unwrap()).await);

    let got = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("datagram not delivered")
        .unwrap();
    assert_eq!(got.type_id, 9);
    assert_eq!(&got.payload[..], &payload[..]);
    assert_eq!(got.source, sender.local_addr().unwrap());

    // Exactly one delivery per arrival.
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    sender.stop().await;
    receiver.stop().await;
}

#[tokio::test]
async fn test_every_listener_sees_the_datagram() {
    let receiver = started().await;
    let mut first = collect(&receiver, 3000);
    let mut second = collect(&receiver, 3000);

    assert!(receiver.send(3000, b"fan-out", receiver.local_addr().unwrap()).await);

    for rx in [&mut first, &mut second] {
        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got.payload[..], b"fan-out");
    }
    receiver.stop().await;
}

#[tokio::test]
async fn test_oversized_payload_is_not_sent() {
    let receiver = started().await;
    let sender = started().await;
    let mut rx = collect(&receiver, 9);

    let payload = vec![0u8; MAX_PAYLOAD + 1];
    assert!(!sender.send(9, &payload, receiver.local_addr().unwrap()).await);
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    sender.stop().await;
    receiver.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let receiver = started().await;
    let mut rx = collect(&receiver, 9);
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = receiver.local_addr().unwrap();

    // Declared length runs past the datagram.
    let mut lying = vec![0, 0, 0, 9, 0, 0, 0, 200];
    lying.extend_from_slice(b"short");
    raw.send_to(&lying, dest).await.unwrap();
    // Shorter than a header.
    raw.send_to(&[0, 0, 0], dest).await.unwrap();
    // Valid.
    let frame = encode_frame(9, b"ok", MAX_PAYLOAD).unwrap();
    raw.send_to(&frame, dest).await.unwrap();

    let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&got.payload[..], b"ok");
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    receiver.stop().await;
}

#[tokio::test]
async fn test_removed_listener_stops_receiving() {
    let receiver = started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Keeps `rx` open after the listener, and its sender, are dropped.
    let _open = tx.clone();
    let id = receiver.add_listener(
        11,
        Arc::new(move |datagram: Datagram| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(datagram);
            }
        }),
    );
    assert!(receiver.remove_listener(11, id));

    assert!(receiver.send(11, b"nobody", receiver.local_addr().unwrap()).await);
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    receiver.stop().await;
}

#[tokio::test]
async fn test_stop_releases_the_port() {
    let channel = started().await;
    let port = channel.local_addr().unwrap().port();
    channel.stop().await;

    let again = FramedChannel::new(ChannelConfig {
        preferred_port: Some(port),
        ..ChannelConfig::loopback()
    });
    assert!(again.start().await);
    again.stop().await;
}
