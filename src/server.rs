//! Listening socket and accept loop

use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::proxy::ProxyConfig;
use crate::socket::Socket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::Instrument;

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Proxy server implementation
pub struct ProxyServer {
  config: Arc<ProxyConfig>,
  ca: Arc<CertificateAuthority>,
}

impl ProxyServer {
  /// Create a new proxy server
  pub fn new(config: ProxyConfig, ca: Arc<CertificateAuthority>) -> Self {
    Self {
      config: Arc::new(config),
      ca,
    }
  }

  /// Bind the listening socket without accepting yet.
  pub async fn bind<A: ToSocketAddrs + std::fmt::Display>(self, addr: A) -> Result<BoundProxy> {
    let listener = TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::config_error(format!("Failed to bind to {}: {}", addr, e)))?;
    let handler = ConnectionHandler::new(self.config.clone(), self.ca)?;
    Ok(BoundProxy {
      listener,
      handler,
      config: self.config,
      next_id: AtomicU64::new(1),
    })
  }

  /// Bind and serve forever.
  pub async fn run<A: ToSocketAddrs + std::fmt::Display>(self, addr: A) -> Result<()> {
    self.bind(addr).await?.serve().await
  }
}

/// A bound listener ready to accept clients.
pub struct BoundProxy {
  listener: TcpListener,
  handler: ConnectionHandler,
  config: Arc<ProxyConfig>,
  next_id: AtomicU64,
}

impl BoundProxy {
  /// Address the listener is bound to.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept clients forever, one task per connection.
  ///
  /// A failing connection is logged and closed; it never stops the loop.
  pub async fn serve(self) -> Result<()> {
    tracing::info!(addr = ?self.listener.local_addr().ok(), "listening");
    loop {
      match self.listener.accept().await {
        Ok((stream, peer)) => {
          let id = self.next_id.fetch_add(1, Ordering::Relaxed);
          let span = tracing::info_span!("conn", id, %peer);
          let client = self.wrap(stream);
          let handler = self.handler.clone();
          tokio::spawn(
            async move {
              tracing::debug!("accepted");
              match handler.handle(client).await {
                Ok(()) => {}
                Err(e) if e.is_tunnel_error() => tracing::error!("Tunnel setup failed: {}", e),
                Err(e) => tracing::error!("Error handling connection: {}", e),
              }
              tracing::debug!("closed");
            }
            .instrument(span),
          );
        }
        Err(e) => accept_failed(e).await,
      }
    }
  }

  fn wrap(&self, stream: TcpStream) -> Socket {
    if let Err(e) = stream.set_nodelay(true) {
      tracing::debug!("set_nodelay failed: {}", e);
    }
    Socket::new(stream, self.config.read_timeout, self.config.write_timeout)
  }
}

async fn accept_failed(e: std::io::Error) {
  tracing::error!("Failed to accept connection: {}", e);
  tokio::time::sleep(ACCEPT_BACKOFF).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::RootTrust;

  #[tokio::test]
  async fn binds_an_ephemeral_port() {
    let ca = Arc::new(CertificateAuthority::new(RootTrust::generate("Test Root").unwrap()));
    let bound = ProxyServer::new(ProxyConfig::default(), ca)
      .bind("127.0.0.1:0")
      .await
      .unwrap();
    assert_ne!(bound.local_addr().unwrap().port(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn accept_error_backs_off() {
    let start = tokio::time::Instant::now();
    accept_failed(std::io::Error::from_raw_os_error(24)).await;
    assert!(start.elapsed() >= ACCEPT_BACKOFF);
  }

  #[tokio::test]
  async fn bind_failure_is_reported() {
    let ca = Arc::new(CertificateAuthority::new(RootTrust::generate("Test Root").unwrap()));
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let result = ProxyServer::new(ProxyConfig::default(), ca).bind(addr).await;
    assert!(matches!(result, Err(Error::Config(_))));
  }
}
