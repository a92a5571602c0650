//! Inbound peer listener
//!
//! Accepts TCP connections, upgrades them to WebSocket links and hands them
//! to the peer network.

use super::PeerNetwork;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Listener for inbound peer links
pub struct PeerListener {
    listener: TcpListener,
    network: PeerNetwork,
}

impl PeerListener {
    /// Bind the listening socket
    pub async fn bind(addr: &str, network: PeerNetwork) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, network })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop. Failed handshakes only affect that connection.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => log::info!("P2P network listening on ws://{}", addr),
            Err(e) => log::warn!("P2P network listening on unknown address: {}", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let network = self.network.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote, network).await {
                            log::warn!("Handshake with {} failed: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Connection error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    network: PeerNetwork,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    network.accept_link(ws, remote.to_string());
    Ok(())
}
