//! Line chat over a message session.
//!
//! ```text
//! cargo run --example chat -- serve 7000
//! cargo run --example chat -- connect 127.0.0.1:7000
//! ```
//!
//! Type lines to send them; an empty line disconnects.

use std::error::Error;
use std::sync::Arc;

use natlink::{
    AcceptorConfig, Reconnecting, Session, SessionAcceptor, SessionConfig, SessionStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Line {
    from: String,
    text: String,
}

const USAGE: &str = "usage: chat serve <port> | chat connect <addr>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().ok_or(USAGE)?;
    let target = args.next().ok_or(USAGE)?;

    match mode.as_str() {
        "serve" => serve(target.parse()?).await,
        "connect" => connect(target.parse()?).await,
        _ => Err(USAGE.into()),
    }
}

async fn print_line(_session: Session, payload: Value) {
    match serde_json::from_value::<Line>(payload) {
        Ok(line) => println!("<{}> {}", line.from, line.text),
        Err(e) => warn!("Unreadable message: {}", e),
    }
}

async fn serve(port: u16) -> Result<(), Box<dyn Error>> {
    let acceptor = SessionAcceptor::new(AcceptorConfig::default());
    acceptor.add_connect_listener(Arc::new(|session: &Session| {
        session.add_listener(Arc::new(print_line));
        let greeting = Line {
            from: "server".into(),
            text: format!("welcome, session {}", session.id()),
        };
        session.send(&greeting).is_ok()
    }));

    if !acceptor.start(port).await {
        return Err(format!("could not listen on port {}", port).into());
    }
    info!("Listening on {:?}; press Ctrl-C to stop", acceptor.local_addr());

    let from = "server".to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(text) if !text.is_empty() => {
                    for session in acceptor.sessions() {
                        let line = Line { from: from.clone(), text: text.clone() };
                        if let Err(e) = session.send(&line) {
                            warn!("Session {}: {}", session.id(), e);
                        }
                    }
                }
                _ => break,
            },
        }
    }

    acceptor.stop().await;
    Ok(())
}

async fn connect(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    let session = Session::new(addr, SessionConfig::default());
    session.add_listener(Arc::new(Reconnecting(print_line)));
    if !session.connect().await {
        return Err(format!("could not connect to {}", addr).into());
    }

    let from = format!("client-{}", session.id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = session.closed() => {
                info!("Server closed the session");
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(text) if !text.is_empty() => {
                    let line = Line { from: from.clone(), text };
                    if let Err(e) = session.send(&line) {
                        warn!("{}", e);
                    }
                }
                _ => break,
            },
        }
    }

    if session.status() == SessionStatus::Connected {
        session.disconnect().await;
    }
    Ok(())
}
