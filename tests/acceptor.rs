//! Session acceptor gating and shutdown.

use std::sync::Arc;
use std::time::Duration;

use natlink::{AcceptorConfig, Session, SessionAcceptor, SessionConfig, SessionStatus};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn config() -> AcceptorConfig {
    AcceptorConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        session: client_config(),
    }
}

fn client_config() -> SessionConfig {
    SessionConfig {
        read_timeout: Duration::from_millis(100),
        disconnect_linger: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

async fn wait_for_count(acceptor: &SessionAcceptor, count: usize) {
    timeout(Duration::from_secs(5), async {
        while acceptor.session_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active set never reached the expected size");
}

#[tokio::test]
async fn test_rejected_session_is_closed_and_excluded() {
    let acceptor = SessionAcceptor::new(config());
    acceptor.add_connect_listener(Arc::new(|_: &Session| true));
    acceptor.add_connect_listener(Arc::new(|session: &Session| session.id() == 0));
    assert!(acceptor.start(0).await);

    let client = Session::new(acceptor.local_addr().unwrap(), client_config());
    assert!(client.connect().await);
    timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client was not disconnected");

    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert_eq!(acceptor.session_count(), 0);
    assert!(acceptor.sessions().is_empty());
    acceptor.stop().await;
}

#[tokio::test]
async fn test_accepted_session_forwards_data() {
    let acceptor = SessionAcceptor::new(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    acceptor.add_connect_listener(Arc::new(move |session: &Session| {
        let tx = tx.clone();
        session.add_listener(Arc::new(move |session: Session, payload: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((session.id(), payload));
            }
        }));
        true
    }));
    assert!(acceptor.start(0).await);

    let client = Session::new(acceptor.local_addr().unwrap(), client_config());
    assert!(client.connect().await);
    client.send(&vec![1, 2, 3]).unwrap();

    let (id, payload) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, serde_json::json!([1, 2, 3]));
    wait_for_count(&acceptor, 1).await;
    let server = acceptor.sessions().remove(0);
    assert_eq!(server.id(), id);
    // The server sees the client's ephemeral port, not its own.
    assert!(server.peer_addr().ip().is_loopback());
    assert_ne!(server.peer_addr().port(), acceptor.local_addr().unwrap().port());

    client.disconnect().await;
    wait_for_count(&acceptor, 0).await;
    acceptor.stop().await;
}

#[tokio::test]
async fn test_greeting_queued_by_connect_listener_arrives() {
    let acceptor = SessionAcceptor::new(config());
    acceptor.add_connect_listener(Arc::new(|session: &Session| {
        session.send("welcome").is_ok()
    }));
    assert!(acceptor.start(0).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Session::new(acceptor.local_addr().unwrap(), client_config());
    client.add_listener(Arc::new(move |_: Session, payload: Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload);
        }
    }));
    assert!(client.connect().await);

    let greeting = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(greeting, Value::from("welcome"));
    client.disconnect().await;
    acceptor.stop().await;
}

#[tokio::test]
async fn test_stop_disconnects_every_session() {
    let acceptor = SessionAcceptor::new(config());
    assert!(acceptor.start(0).await);
    let addr = acceptor.local_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = Session::new(addr, client_config());
        assert!(client.connect().await);
        clients.push(client);
    }
    wait_for_count(&acceptor, 3).await;

    timeout(Duration::from_secs(5), acceptor.stop()).await.unwrap();
    assert_eq!(acceptor.session_count(), 0);
    assert!(acceptor.local_addr().is_none());
    for client in &clients {
        timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    }

    // The listening socket is gone.
    let late = Session::new(addr, client_config());
    assert!(!late.connect().await);

    // Idempotent.
    acceptor.stop().await;
}
