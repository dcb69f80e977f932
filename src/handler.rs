//! Per-connection state machine.
//!
//! ```text
//! Classify -> TunnelSetup  -> Relay -> Closed
//!          -> PlainForward -> Relay -> Closed
//!                             Relay -> Classify (client retargeted)
//! ```

use crate::ca::CertificateAuthority;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::proxy::ProxyConfig;
use crate::relay::{relay, RelayOutcome, Session};
use crate::request::RequestHead;
use crate::socket::Socket;
use crate::tls;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Reply sent to the client once a CONNECT tunnel is ready for its handshake.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Drives one accepted client connection from its first request to close.
#[derive(Clone)]
pub struct ConnectionHandler {
  config: Arc<ProxyConfig>,
  connector: Connector,
  ca: Arc<CertificateAuthority>,
}

impl ConnectionHandler {
  /// Handler sharing `config` and `ca` with every other connection.
  pub fn new(config: Arc<ProxyConfig>, ca: Arc<CertificateAuthority>) -> Result<Self> {
    let connector = config.connector()?;
    Ok(Self {
      config,
      connector,
      ca,
    })
  }

  /// Serve `client` until either side closes.
  ///
  /// A retarget from the relay loops back to classification with the same
  /// client socket, so a long-lived connection may visit several origins.
  pub async fn handle(&self, mut client: Socket) -> Result<()> {
    let mut head = match RequestHead::read_from(&mut client, None).await {
      Ok(Some(head)) => head,
      Ok(None) => {
        tracing::debug!("client closed before sending a request");
        return Ok(());
      }
      Err(Error::Io(e)) => {
        tracing::debug!("client read failed before a request: {}", e);
        return Ok(());
      }
      Err(e) => return Err(e),
    };
    loop {
      tracing::debug!(request = ?head, "classify");
      let session = if head.is_tunnel() {
        self.tunnel_setup(client, head).await?
      } else {
        self.plain_forward(client, head).await?
      };
      match relay(session, &self.config).await? {
        RelayOutcome::Closed => return Ok(()),
        RelayOutcome::Retarget {
          client: next_client,
          head: next_head,
        } => {
          client = next_client;
          head = next_head;
        }
      }
    }
  }

  /// Dial the target (and the upstream, when chaining), present a forged
  /// identity to the client and start relaying decrypted traffic.
  async fn tunnel_setup(&self, mut client: Socket, head: RequestHead) -> Result<Session> {
    let (peer, origin_cert) = match &self.config.upstream {
      Some(upstream) => {
        // The origin is dialed only for its certificate.
        let (probe, cert) = self.connector.connect_tls(head.host(), head.port()).await?;
        drop(probe);
        let peer = self
          .connector
          .connect_plain(upstream.host(), upstream.port())
          .await?;
        tracing::debug!(%upstream, target = %head.authority(), "tunnel via upstream");
        (peer, cert)
      }
      None => self.connector.connect_tls(head.host(), head.port()).await?,
    };
    let identity = self.ca.forge(&origin_cert).await?;
    client.send(CONNECTION_ESTABLISHED).await?;
    let client = tls::accept(identity.server_config(), client).await?;
    tracing::debug!(subject = identity.subject(), "client handshake complete");
    Ok(Session {
      client,
      peer,
      current: head,
      pending: None,
    })
  }

  /// Dial the target (or the upstream) in the clear; the request itself is
  /// sent by the relay.
  async fn plain_forward(&self, client: Socket, head: RequestHead) -> Result<Session> {
    let (peer, pending) = match &self.config.upstream {
      Some(upstream) => {
        let peer = self
          .connector
          .connect_plain(upstream.host(), upstream.port())
          .await?;
        (peer, head.raw().clone())
      }
      None => {
        let peer = self.connector.connect_plain(head.host(), head.port()).await?;
        (peer, with_blank_line(head.raw()))
      }
    };
    Ok(Session {
      client,
      peer,
      current: head,
      pending: Some(pending),
    })
  }
}

/// The raw head followed by one extra `\r\n`.
fn with_blank_line(raw: &Bytes) -> Bytes {
  let mut buf = BytesMut::with_capacity(raw.len() + 2);
  buf.put_slice(raw);
  buf.put_slice(b"\r\n");
  buf.freeze()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::RootTrust;
  use std::time::Duration;

  fn handler() -> ConnectionHandler {
    let ca = CertificateAuthority::new(RootTrust::generate("Handler Test Root").unwrap());
    ConnectionHandler::new(Arc::new(ProxyConfig::default()), Arc::new(ca)).unwrap()
  }

  #[tokio::test]
  async fn silent_client_ends_quietly() {
    let (_client_end, proxy_end) = tokio::io::duplex(1024);
    let client = Socket::new(proxy_end, Some(Duration::from_millis(20)), None);
    assert!(handler().handle(client).await.is_ok());
  }

  #[tokio::test]
  async fn closed_client_ends_quietly() {
    let (client_end, proxy_end) = tokio::io::duplex(1024);
    drop(client_end);
    assert!(handler().handle(Socket::plain(proxy_end)).await.is_ok());
  }

  #[tokio::test]
  async fn malformed_first_request_is_an_error() {
    let (mut client_end, proxy_end) = tokio::io::duplex(1024);
    tokio::io::AsyncWriteExt::write_all(&mut client_end, b"CONNECT :0 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let err = handler().handle(Socket::plain(proxy_end)).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }

  #[test]
  fn blank_line_is_appended_once() {
    let raw = Bytes::from_static(b"GET http://a.test/ HTTP/1.0\r\n");
    assert_eq!(
      with_blank_line(&raw).as_ref(),
      b"GET http://a.test/ HTTP/1.0\r\n\r\n"
    );
  }

  #[test]
  fn tunnel_reply_is_exact() {
    assert_eq!(
      CONNECTION_ESTABLISHED,
      b"HTTP/1.0 200 Connection established\r\n\r\n"
    );
  }
}
