//! Plain TCP transport.
//!
//! Carries the NETCONF byte stream directly over TCP with no security
//! layer. Useful for tests, lab setups and deployments where a tunnel
//! provides confidentiality.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::Transport;
use crate::config::DEFAULT_PORT;
use crate::error::{NetconfError, Result};
use crate::server::NetconfServer;
use crate::session::{ClientOptions, ClientSession};

const TRANSPORT_NAME: &str = "tcp";

/// TCP listener transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Address to listen on.
    listen_addr: SocketAddr,
}

impl TcpTransport {
    /// Create a new TCP transport.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }

    /// Create with localhost address.
    pub fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Accept on an already-bound listener until `shutdown` resolves, then
    /// close all live sessions.
    pub async fn serve_listener(
        listener: TcpListener,
        server: NetconfServer,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|e| NetconfError::Server(format!("TCP accept failed: {}", e)))?;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                    }
                    tracing::debug!("Accepted TCP connection from {}", peer);
                    server.spawn_connection(stream, peer.to_string(), TRANSPORT_NAME);
                },
                () = &mut shutdown => {
                    let closed = server.shutdown().await;
                    tracing::info!("TCP transport stopped; {} sessions closing", closed);
                    return Ok(());
                },
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::localhost(DEFAULT_PORT)
    }
}

impl Transport for TcpTransport {
    fn serve(&self, server: NetconfServer) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let addr = self.listen_addr;

        Box::pin(async move {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                NetconfError::Server(format!("Failed to bind TCP to {}: {}", addr, e))
            })?;
            tracing::info!("TCP transport listening on {}", addr);

            Self::serve_listener(listener, server, std::future::pending()).await
        })
    }

    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn listen_addr(&self) -> String {
        self.listen_addr.to_string()
    }
}

/// Connect to a server over TCP and run the hello exchange.
pub async fn connect(addr: impl ToSocketAddrs, options: ClientOptions) -> Result<ClientSession> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    ClientSession::connect(stream, options).await
}
