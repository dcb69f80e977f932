//! Bidirectional relay between a client and its current peer.
//!
//! Server-to-client traffic is copied verbatim. Client-to-server traffic is
//! read as successive request heads so a visible proxy can notice when the
//! client starts talking about a different host.

use crate::errors::{Error, Result};
use crate::proxy::ProxyConfig;
use crate::request::RequestHead;
use crate::socket::{Chunk, Socket};
use bytes::Bytes;

/// The two ends of one intercepted conversation.
#[derive(Debug)]
pub struct Session {
  /// Client side, plain or already upgraded to TLS
  pub client: Socket,
  /// Origin or upstream side
  pub peer: Socket,
  /// Request that selected the current peer
  pub current: RequestHead,
  /// Bytes to write to the peer before relaying starts
  pub pending: Option<Bytes>,
}

/// How a relay loop ended.
#[derive(Debug)]
pub enum RelayOutcome {
  /// Either side ended or failed; both sockets are closed.
  Closed,
  /// The client asked for another target. The peer is closed; the client
  /// socket is handed back untouched along with the request that names the
  /// new target.
  Retarget {
    /// Client socket, still open
    client: Socket,
    /// Request for the new target, not yet forwarded anywhere
    head: RequestHead,
  },
}

enum Ready {
  Client(std::io::Result<Chunk>),
  Peer(std::io::Result<Chunk>),
}

/// Pump bytes between `session.client` and `session.peer` until one side
/// ends or the client retargets.
///
/// Transport failures end the loop like a normal stream end. Only a
/// malformed client request is returned as an error.
pub async fn relay(mut session: Session, config: &ProxyConfig) -> Result<RelayOutcome> {
  if let Some(pending) = session.pending.take() {
    tracing::info!(direction = "client->server", initial = true, request = ?session.current);
    if let Err(e) = session.peer.send(&pending).await {
      tracing::debug!("writing initial request to peer failed: {}", e);
      session.close().await;
      return Ok(RelayOutcome::Closed);
    }
  }

  loop {
    let ready = tokio::select! {
      r = session.client.read_some() => Ready::Client(r),
      r = session.peer.read_some() => Ready::Peer(r),
    };
    match ready {
      Ready::Peer(Ok(Chunk::Data(data))) => {
        tracing::info!(
          direction = "server->client",
          data = %String::from_utf8_lossy(&data)
        );
        if let Err(e) = session.client.send(&data).await {
          tracing::debug!("client write failed: {}", e);
          break;
        }
      }
      Ready::Client(Ok(Chunk::Data(first))) => {
        let head = match RequestHead::read_from(&mut session.client, Some(first)).await {
          Ok(Some(head)) => head,
          Ok(None) => {
            tracing::debug!("client closed mid-request");
            break;
          }
          Err(Error::Io(e)) => {
            tracing::debug!("client read failed: {}", e);
            break;
          }
          Err(e) => {
            session.close().await;
            return Err(e);
          }
        };
        if retargets(config, &session.current, &head) {
          tracing::debug!(
            from = %session.current.authority(),
            to = %head.authority(),
            "client switched target"
          );
          let Session { client, peer, .. } = session;
          drop(peer);
          return Ok(RelayOutcome::Retarget { client, head });
        }
        tracing::info!(direction = "client->server", request = ?head);
        if let Err(e) = session.peer.send(head.raw()).await {
          tracing::debug!("peer write failed: {}", e);
          break;
        }
      }
      Ready::Client(Ok(Chunk::StreamEnd)) => {
        tracing::debug!("client closed the connection");
        break;
      }
      Ready::Peer(Ok(Chunk::StreamEnd)) => {
        tracing::debug!("server closed the connection");
        break;
      }
      Ready::Client(Err(e)) | Ready::Peer(Err(e)) => {
        tracing::debug!("relay read failed: {}", e);
        break;
      }
    }
  }
  session.close().await;
  Ok(RelayOutcome::Closed)
}

/// A new request moves the session only when retargeting is enabled and the
/// request names a different absolute `(host, port)`.
fn retargets(config: &ProxyConfig, current: &RequestHead, next: &RequestHead) -> bool {
  config.retarget_enabled() && !next.is_origin_form() && !next.same_target(current)
}

impl Session {
  async fn close(mut self) {
    // Both ends are dropped below regardless; shutdown only flushes a
    // close_notify or FIN where the transport still accepts one.
    let _ = self.client.shutdown().await;
    let _ = self.peer.shutdown().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::Upstream;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  fn head(raw: &'static str) -> RequestHead {
    RequestHead::parse(Bytes::from_static(raw.as_bytes())).unwrap()
  }

  /// Returns (session, test-side client end, test-side origin end).
  fn session(current: RequestHead, pending: Option<Bytes>) -> (Session, DuplexStream, DuplexStream) {
    let (client_end, proxy_client) = tokio::io::duplex(64 * 1024);
    let (origin_end, proxy_peer) = tokio::io::duplex(64 * 1024);
    let session = Session {
      client: Socket::plain(proxy_client),
      peer: Socket::plain(proxy_peer),
      current,
      pending,
    };
    (session, client_end, origin_end)
  }

  async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
  }

  #[tokio::test]
  async fn relays_both_directions_in_order() {
    let initial = "GET http://a.test/one HTTP/1.1\r\n\r\n";
    let (session, mut client, mut origin) = session(
      head(initial),
      Some(Bytes::from_static(initial.as_bytes())),
    );
    let config = ProxyConfig::default();
    let relay = tokio::spawn(async move { relay(session, &config).await });

    assert_eq!(read_n(&mut origin, initial.len()).await, initial.as_bytes());

    origin.write_all(b"HTTP/1.1 200 OK\r\n\r\nfirst").await.unwrap();
    assert_eq!(read_n(&mut client, 24).await, b"HTTP/1.1 200 OK\r\n\r\nfirst");

    let second = b"POST http://a.test/two HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    client.write_all(second).await.unwrap();
    assert_eq!(read_n(&mut origin, second.len()).await, second);

    origin.write_all(b"more").await.unwrap();
    assert_eq!(read_n(&mut client, 4).await, b"more");

    drop(client);
    assert!(matches!(relay.await.unwrap().unwrap(), RelayOutcome::Closed));
    let mut rest = Vec::new();
    origin.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn peer_end_closes_session() {
    let (session, mut client, origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let config = ProxyConfig::default();
    let relay = tokio::spawn(async move { relay(session, &config).await });
    drop(origin);
    assert!(matches!(relay.await.unwrap().unwrap(), RelayOutcome::Closed));
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn new_host_retargets_without_touching_old_peer() {
    let (session, mut client, mut origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let config = ProxyConfig::default();
    let relay = tokio::spawn(async move { relay(session, &config).await });

    let next = b"GET http://b.test/ HTTP/1.1\r\n\r\n";
    client.write_all(next).await.unwrap();

    match relay.await.unwrap().unwrap() {
      RelayOutcome::Retarget { head, .. } => {
        assert_eq!((head.host(), head.port()), ("b.test", 80));
        assert_eq!(head.raw().as_ref(), next);
      }
      RelayOutcome::Closed => panic!("expected a retarget"),
    }
    let mut seen = Vec::new();
    origin.read_to_end(&mut seen).await.unwrap();
    assert!(seen.is_empty(), "old peer must not receive the new request");
  }

  #[tokio::test]
  async fn retarget_hands_back_a_live_client() {
    let (session, mut client, _origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let config = ProxyConfig::default();
    client
      .write_all(b"CONNECT b.test:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let outcome = relay(session, &config).await.unwrap();
    let RelayOutcome::Retarget {
      client: mut proxy_client,
      head,
    } = outcome
    else {
      panic!("expected a retarget");
    };
    assert!(head.is_tunnel());
    proxy_client.send(b"still open").await.unwrap();
    assert_eq!(read_n(&mut client, 10).await, b"still open");
  }

  #[tokio::test]
  async fn same_host_is_forwarded() {
    let (session, mut client, mut origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let config = ProxyConfig::default();
    let relay = tokio::spawn(async move { relay(session, &config).await });

    let inner = b"GET /inside HTTP/1.1\r\nHost: a.test\r\n\r\n";
    client.write_all(inner).await.unwrap();
    assert_eq!(read_n(&mut origin, inner.len()).await, inner);

    drop(client);
    assert!(matches!(relay.await.unwrap().unwrap(), RelayOutcome::Closed));
  }

  async fn assert_forwarded_despite_new_host(config: ProxyConfig) {
    let (session, mut client, mut origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let relay = tokio::spawn(async move { relay(session, &config).await });

    let next = b"GET http://b.test/ HTTP/1.1\r\n\r\n";
    client.write_all(next).await.unwrap();
    assert_eq!(read_n(&mut origin, next.len()).await, next);

    drop(client);
    assert!(matches!(relay.await.unwrap().unwrap(), RelayOutcome::Closed));
  }

  #[tokio::test]
  async fn invisible_mode_never_retargets() {
    assert_forwarded_despite_new_host(ProxyConfig {
      invisible: true,
      ..Default::default()
    })
    .await;
  }

  #[tokio::test]
  async fn upstream_mode_never_retargets() {
    assert_forwarded_despite_new_host(ProxyConfig {
      upstream: Some(Upstream::new("127.0.0.1", 3128)),
      ..Default::default()
    })
    .await;
  }

  #[tokio::test]
  async fn malformed_client_request_is_an_error() {
    let (session, mut client, _origin) = session(head("CONNECT a.test:443 HTTP/1.1\r\n\r\n"), None);
    let config = ProxyConfig::default();
    client.write_all(b"GET\r\n").await.unwrap();
    let err = relay(session, &config).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
  }
}
