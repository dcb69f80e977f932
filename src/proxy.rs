//! Proxy configuration

use crate::connector::{authority, Connector};
use crate::errors::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A chained upstream proxy, given as `HOST:PORT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
  host: String,
  port: u16,
}

impl Upstream {
  /// Upstream at `host:port`.
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
  /// Upstream host
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Upstream port
  pub fn port(&self) -> u16 {
    self.port
  }
}

impl FromStr for Upstream {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let invalid = || Error::config_error(format!("proxy must be in the form host:port, got {:?}", s));
    let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(invalid());
    }
    let port = port
      .parse::<u16>()
      .ok()
      .filter(|p| *p != 0)
      .ok_or_else(invalid)?;
    Ok(Upstream::new(host, port))
  }
}

impl fmt::Display for Upstream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&authority(&self.host, self.port))
  }
}

/// Process-wide proxy configuration, fixed at startup.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
  /// Transparent operation: the client does not negotiate a CONNECT for
  /// every host, so mid-stream retargeting is disabled
  pub invisible: bool,
  /// Relay traffic to this proxy instead of dialing origins directly
  pub upstream: Option<Upstream>,
  /// Timeout for dialing origins and the upstream; `None` waits forever
  pub connect_timeout: Option<Duration>,
  /// Per-read timeout on both relay sides; `None` lets an idle peer hold
  /// the connection open indefinitely
  pub read_timeout: Option<Duration>,
  /// Per-write timeout on both relay sides
  pub write_timeout: Option<Duration>,
}

impl ProxyConfig {
  /// True when an upstream proxy is configured.
  pub fn upstream_proxy(&self) -> bool {
    self.upstream.is_some()
  }

  /// Retargeting applies only to a visible proxy dialing origins itself.
  pub fn retarget_enabled(&self) -> bool {
    !self.invisible && !self.upstream_proxy()
  }

  /// Connector honoring the configured timeouts.
  pub fn connector(&self) -> Result<Connector> {
    Connector::builder()
      .connect_timeout(self.connect_timeout)
      .read_timeout(self.read_timeout)
      .write_timeout(self.write_timeout)
      .nodelay(true)
      .build()
  }
}
