//! Hole-punching negotiation between channels on loopback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use natlink::{
    ChannelConfig, Datagram, FramedChannel, NegotiationPhase, NegotiatorConfig, Peer,
    PeerNegotiator, PeerStatus, PeerStatusListener, PhaseTiming, CONTACT_REQUEST, CONTACT_RESPONSE,
    KEEP_ALIVE,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn fast() -> NegotiatorConfig {
    NegotiatorConfig {
        request: PhaseTiming::new(Duration::from_millis(20), 100),
        request_response: PhaseTiming::new(Duration::from_millis(20), 5),
        keep_alive: PhaseTiming::new(Duration::from_millis(40), 5),
    }
}

async fn channel() -> FramedChannel {
    let channel = FramedChannel::new(ChannelConfig {
        recv_timeout: Duration::from_millis(100),
        ..ChannelConfig::loopback()
    });
    assert!(channel.start().await, "loopback bind failed");
    channel
}

async fn node(config: NegotiatorConfig) -> PeerNegotiator {
    PeerNegotiator::new(channel().await, config)
}

fn counter(channel: &FramedChannel, type_id: u32) -> Arc<AtomicU32> {
    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&count);
    channel.add_listener(
        type_id,
        Arc::new(move |_: Datagram| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );
    count
}

#[tokio::test]
async fn test_two_negotiators_connect() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();

    let (connected_a, connected_b) = timeout(
        Duration::from_secs(5),
        async { tokio::join!(a.add_peer(b_addr, true, None), b.add_peer(a_addr, true, None)) },
    )
    .await
    .expect("negotiation did not settle");
    assert!(connected_a);
    assert!(connected_b);

    assert_eq!(a.phase(b_addr), Some(NegotiationPhase::KeepAlive));
    let peer = a.peer(b_addr).unwrap();
    assert_eq!(peer.remote_description, Some(b.peer(a_addr).unwrap().local_description));

    a.shutdown().await;
    b.shutdown().await;
    a.channel().stop().await;
    b.channel().stop().await;
}

#[tokio::test]
async fn test_connected_peers_stay_alive() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();
    a.add_peer(b_addr, false, None).await;
    b.add_peer(a_addr, false, None).await;
    assert!(timeout(Duration::from_secs(5), a.wait_for_status(b_addr, PeerStatus::Connected))
        .await
        .unwrap());

    // Well past keep-alive cap * interval; acks keep resetting the counter.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(a.status(b_addr), Some(PeerStatus::Connected));
    assert!(a.attempts(b_addr).unwrap() < 5);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_requests_give_connection_error_at_cap() {
    let cap = 6;
    let config = NegotiatorConfig {
        request: PhaseTiming::new(Duration::from_millis(20), cap),
        ..fast()
    };
    let a = node(config).await;

    // A bare channel that never answers.
    let sink = channel().await;
    let requests = counter(&sink, CONTACT_REQUEST);
    let sink_addr = sink.local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn PeerStatusListener> = Arc::new(move |peer: Peer, status: PeerStatus| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((peer.addr, status));
        }
    });

    let connected = timeout(Duration::from_secs(5), a.add_peer(sink_addr, true, Some(listener)))
        .await
        .unwrap();
    assert!(!connected);
    assert_eq!(a.status(sink_addr), Some(PeerStatus::ConnectionError));
    assert_eq!(a.phase(sink_addr), Some(NegotiationPhase::Stopped));

    let (addr, status) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(addr, sink_addr);
    assert_eq!(status, PeerStatus::ConnectionError);

    // Nothing more goes out once the cap is hit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(requests.load(Ordering::SeqCst), cap);

    a.shutdown().await;
    sink.stop().await;
}

#[tokio::test]
async fn test_lost_peer_becomes_disconnected() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();
    a.add_peer(b_addr, false, None).await;
    assert!(timeout(Duration::from_secs(5), b.add_peer(a_addr, true, None))
        .await
        .unwrap());
    assert!(timeout(Duration::from_secs(5), a.wait_for_status(b_addr, PeerStatus::Connected))
        .await
        .unwrap());

    // Silence b entirely; a's keep-alives go unanswered.
    b.shutdown().await;
    b.channel().stop().await;

    assert!(timeout(Duration::from_secs(5), a.wait_for_status(b_addr, PeerStatus::Disconnected))
        .await
        .unwrap());
    a.shutdown().await;
}

#[tokio::test]
async fn test_keep_alive_is_acknowledged_by_any_registered_peer() {
    let a = node(fast()).await;
    let sink = channel().await;
    let sink_addr = sink.local_addr().unwrap();
    let acks = counter(&sink, natlink::KEEP_ALIVE_ACK);
    a.add_peer(sink_addr, false, None).await;

    // A keep-alive from the sink moves a straight to keep-alive and is acked.
    assert!(sink.send(KEEP_ALIVE, &7u64.to_be_bytes(), a.channel().local_addr().unwrap()).await);
    assert!(timeout(Duration::from_secs(2), a.wait_for_status(sink_addr, PeerStatus::Connected))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(acks.load(Ordering::SeqCst) >= 1);
    assert_eq!(a.peer(sink_addr).unwrap().remote_description, Some(7));

    a.shutdown().await;
    sink.stop().await;
}

#[tokio::test]
async fn test_non_blocking_add_returns_false() {
    let a = node(fast()).await;
    let sink = channel().await;
    let sink_addr = sink.local_addr().unwrap();

    assert!(!a.add_peer(sink_addr, false, None).await);
    assert_eq!(a.status(sink_addr), Some(PeerStatus::AwaitingConnection));
    assert_eq!(a.peers().len(), 1);

    a.shutdown().await;
    assert!(a.peers().is_empty());
    sink.stop().await;
}

#[tokio::test]
async fn test_removing_connected_peer_reports_disconnected() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn PeerStatusListener> = Arc::new(move |_: Peer, status: PeerStatus| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(status);
        }
    });
    a.add_peer(b_addr, false, Some(listener)).await;
    b.add_peer(a_addr, false, None).await;

    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, PeerStatus::Connected);

    assert!(a.remove_peer(b_addr).await);
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, PeerStatus::Disconnected);
    assert_eq!(a.status(b_addr), None);
    assert!(!a.remove_peer(b_addr).await);

    b.shutdown().await;
}

#[tokio::test]
async fn test_application_datagrams_flow_after_connect() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.channel().add_listener(
        50,
        Arc::new(move |datagram: Datagram| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(datagram.payload);
            }
        }),
    );

    a.add_peer(b_addr, false, None).await;
    assert!(timeout(Duration::from_secs(5), b.add_peer(a_addr, true, None))
        .await
        .unwrap());

    assert!(!a.send_to_peer(b_addr, CONTACT_REQUEST, b"nope").await);
    assert!(a.send_to_peer(b_addr, 50, b"payload").await);
    let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(&got[..], b"payload");

    a.shutdown().await;
    b.shutdown().await;
}

async fn wait_until(count: &AtomicU32, at_least: u32) {
    while count.load(Ordering::SeqCst) < at_least {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_request_response_phase_gives_up_at_its_own_cap() {
    let cap = 5;
    let config = NegotiatorConfig {
        // One request round, then nothing until a phase change wakes the worker.
        request: PhaseTiming::new(Duration::from_secs(30), 100),
        request_response: PhaseTiming::new(Duration::from_millis(30), cap),
        ..fast()
    };
    let a = node(config).await;
    let a_addr = a.channel().local_addr().unwrap();

    let sink = channel().await;
    let sink_addr = sink.local_addr().unwrap();
    let requests = counter(&sink, CONTACT_REQUEST);
    let responses = counter(&sink, CONTACT_RESPONSE);

    assert!(!a.add_peer(sink_addr, false, None).await);
    timeout(Duration::from_secs(2), wait_until(&requests, 1)).await.unwrap();

    // The sink only ever asks; it never answers.
    assert!(sink.send(CONTACT_REQUEST, &9u64.to_be_bytes(), a_addr).await);
    assert!(timeout(Duration::from_secs(5), a.wait_for_status(sink_addr, PeerStatus::ConnectionError))
        .await
        .unwrap());
    assert_eq!(a.phase(sink_addr), Some(NegotiationPhase::Stopped));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    // One response from the request round, then exactly `cap` more.
    assert_eq!(responses.load(Ordering::SeqCst), 1 + cap);

    a.shutdown().await;
    sink.stop().await;
}

#[tokio::test]
async fn test_wait_for_status_returns_false_when_peer_removed() {
    let a = node(fast()).await;
    let sink = channel().await;
    let sink_addr = sink.local_addr().unwrap();
    a.add_peer(sink_addr, false, None).await;

    let (reached, removed) = timeout(Duration::from_secs(2), async {
        tokio::join!(a.wait_for_status(sink_addr, PeerStatus::Connected), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.remove_peer(sink_addr).await
        })
    })
    .await
    .unwrap();
    assert!(removed);
    assert!(!reached);
    assert!(!a.wait_for_status(sink_addr, PeerStatus::Connected).await);

    a.shutdown().await;
    sink.stop().await;
}

#[tokio::test]
async fn test_adding_live_peer_again_attaches_listener() {
    let a = node(fast()).await;
    let b = node(fast()).await;
    let a_addr = a.channel().local_addr().unwrap();
    let b_addr = b.channel().local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn PeerStatusListener> = Arc::new(move |_: Peer, status: PeerStatus| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(status);
        }
    });

    a.add_peer(b_addr, false, None).await;
    let description = a.peer(b_addr).unwrap().local_description;
    a.add_peer(b_addr, false, Some(listener)).await;
    assert_eq!(a.peers().len(), 1);
    assert_eq!(a.peer(b_addr).unwrap().local_description, description);

    b.add_peer(a_addr, false, None).await;
    let status = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(status, PeerStatus::Connected);

    a.shutdown().await;
    b.shutdown().await;
}
