//! UDP hole punching between two hosts.
//!
//! Run one copy on each side, each pointing at the other's public address:
//!
//! ```text
//! cargo run --example punch -- 40000 203.0.113.7:40000
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natlink::{
    ChannelConfig, Datagram, FramedChannel, NegotiatorConfig, Peer, PeerNegotiator, PeerStatus,
    PeerStatusListener,
};
use tracing::{info, warn};

const GREETING: u32 = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().ok_or("usage: punch <local-port> <peer-addr>")?.parse()?;
    let peer: SocketAddr = args.next().ok_or("usage: punch <local-port> <peer-addr>")?.parse()?;

    let channel = FramedChannel::new(ChannelConfig::with_port(port));
    if !channel.start().await {
        return Err(format!("could not bind UDP port {}", port).into());
    }

    channel.add_listener(
        GREETING,
        Arc::new(|datagram: Datagram| async move {
            info!(
                "{} says: {}",
                datagram.source,
                String::from_utf8_lossy(&datagram.payload)
            );
        }),
    );

    let negotiator = PeerNegotiator::new(channel.clone(), NegotiatorConfig::default());
    let watcher: Arc<dyn PeerStatusListener> = Arc::new(|peer: Peer, status: PeerStatus| async move {
        info!("{} is now {:?}", peer, status);
    });

    info!("Punching towards {}...", peer);
    if !negotiator.add_peer(peer, true, Some(watcher)).await {
        warn!("Could not reach {}", peer);
        channel.stop().await;
        return Ok(());
    }

    for n in 1..=5 {
        let text = format!("hello #{}", n);
        negotiator.send_to_peer(peer, GREETING, text.as_bytes()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    negotiator.shutdown().await;
    channel.stop().await;
    info!("Done");
    Ok(())
}
