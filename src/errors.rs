//! proxy error
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `sslproxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting a connection.
///
/// Every variant is contained at the connection boundary: the task serving
/// the connection logs it and closes the client socket.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Malformed request line or request target
  #[error("parse error: {0}")]
  Parse(String),
  /// Failed to reach the origin or the upstream proxy
  #[error("failed to connect to {addr}: {source}")]
  Dial {
    /// `host:port` that was dialed
    addr: String,
    /// underlying socket error
    #[source]
    source: std::io::Error,
  },
  /// TLS handshake failure, in either role
  #[error("TLS handshake failed: {0}")]
  Handshake(String),
  /// Root trust loading or certificate forging failure
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Invalid configuration
  #[error("invalid configuration: {0}")]
  Config(String),
  /// Transport error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a parse error and log it
  pub fn parse_error(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a dial error and log it
  pub fn dial_error(addr: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::Dial {
      addr: addr.into(),
      source,
    };
    tracing::debug!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake_error(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a configuration error
  pub fn config_error(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }

  /// True for the failures that abort a CONNECT tunnel setup.
  pub fn is_tunnel_error(&self) -> bool {
    matches!(
      self,
      Error::Dial { .. } | Error::Handshake(_) | Error::Certificate(_)
    )
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}
