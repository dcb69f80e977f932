use crate::errors::{Error, Result};
use crate::socket::Socket;
use crate::tls::{self, PeerCertificate};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone, Debug, Default)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Enables a read timeout on every dialed socket.
  ///
  /// Default is no timeout: an idle peer keeps the connection open forever.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout on every dialed socket.
  ///
  /// Default is no timeout.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is no timeout.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Combine the configuration of this builder with a TLS client config to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: tls::origin_connector()?,
    })
  }
}

/// Dials origins and upstream proxies.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl Connector {
  /// Start building a connector.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Wrap an accepted or externally created stream with this connector's timeouts.
  pub fn wrap(&self, stream: TcpStream) -> Socket {
    Socket::new(stream, self.read_timeout, self.write_timeout)
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> std::io::Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr)).await??,
    };
    Ok(self.wrap(s))
  }

  /// Plain TCP connection to `host:port`, trying every resolved address in turn.
  pub async fn connect_plain(&self, host: &str, port: u16) -> Result<Socket> {
    let target = authority(host, port);
    let addrs = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::dial_error(target.clone(), e))?;
    let mut last_err = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!(%target, %addr, "connected");
          return Ok(socket);
        }
        Err(e) => last_err = Some(e),
      }
    }
    let err = last_err.unwrap_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
    });
    Err(Error::dial_error(target, err))
  }

  /// TLS connection to `host:port` as a client; also returns the leaf
  /// certificate the origin presented.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<(Socket, PeerCertificate)> {
    let socket = self.connect_plain(host, port).await?;
    tls::connect(&self.tls, socket, host).await
  }
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}
