//! Request head parsing.
//!
//! Only the request line is interpreted. Everything read off the client is
//! kept in [`RequestHead::raw`] so it can be replayed verbatim to the peer.
use crate::connector::authority;
use crate::errors::{Error, Result};
use crate::socket::{Chunk, Socket};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// Upper bound on the bytes accumulated while waiting for a line end.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const CONNECT: &str = "CONNECT";
const CR_LF: &[u8] = b"\r\n";

/// The first line(s) of a client request and the target it names.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestHead {
  method: String,
  host: String,
  port: u16,
  origin_form: bool,
  raw: Bytes,
}

impl RequestHead {
  /// Read chunks from `client` until the accumulated bytes end with `\r\n`,
  /// then parse them.
  ///
  /// `first` is a chunk the caller already pulled off the socket. Returns
  /// `Ok(None)` when the stream ends before a complete head arrived.
  ///
  /// Only the tail of the buffer is checked, so a request whose body arrives
  /// in the same write and does not end in `\r\n` keeps waiting for more
  /// bytes until the client sends them, closes, or [`MAX_HEAD_SIZE`] is hit.
  pub async fn read_from(client: &mut Socket, first: Option<Bytes>) -> Result<Option<RequestHead>> {
    let mut buf = BytesMut::new();
    if let Some(first) = first {
      buf.extend_from_slice(&first);
    }
    while !buf.ends_with(CR_LF) {
      if buf.len() > MAX_HEAD_SIZE {
        return Err(Error::parse_error(format!(
          "request head exceeds {} bytes",
          MAX_HEAD_SIZE
        )));
      }
      match client.read_some().await? {
        Chunk::Data(data) => buf.extend_from_slice(&data),
        Chunk::StreamEnd => return Ok(None),
      }
    }
    Self::parse(buf.freeze()).map(Some)
  }

  /// Parse a complete head.
  pub fn parse(raw: Bytes) -> Result<RequestHead> {
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
      .next()
      .ok_or_else(|| Error::parse_error("empty request line"))?
      .to_string();
    let target = parts
      .next()
      .ok_or_else(|| Error::parse_error(format!("missing request target: {:?}", request_line)))?;

    let (host, port, origin_form) = if method == CONNECT {
      let (host, port) = parse_host_port(target, 443)?;
      (host, port, false)
    } else if target.starts_with('/') {
      let host_header = lines
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
          let (name, value) = line.split_once(':')?;
          name.trim().eq_ignore_ascii_case("host").then(|| value.trim())
        })
        .ok_or_else(|| Error::parse_error(format!("origin-form target without Host: {}", target)))?;
      let (host, port) = parse_host_port(host_header, 80)?;
      (host, port, true)
    } else {
      let (host, port) = parse_absolute_uri(target)?;
      (host, port, false)
    };

    Ok(RequestHead {
      method,
      host,
      port,
      origin_form,
      raw,
    })
  }

  /// Request method, e.g. `GET` or `CONNECT`.
  pub fn method(&self) -> &str {
    &self.method
  }
  /// Target host, without brackets for IPv6 literals.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Target port.
  pub fn port(&self) -> u16 {
    self.port
  }
  /// Everything read off the client for this head.
  pub fn raw(&self) -> &Bytes {
    &self.raw
  }
  /// `CONNECT` asks for a tunnel.
  pub fn is_tunnel(&self) -> bool {
    self.method == CONNECT
  }
  /// The target was `/path` and the host came from the `Host` header.
  pub fn is_origin_form(&self) -> bool {
    self.origin_form
  }
  /// `host:port` of the target.
  pub fn authority(&self) -> String {
    authority(&self.host, self.port)
  }
  /// Same `(host, port)` as `other`.
  pub fn same_target(&self, other: &RequestHead) -> bool {
    self.host == other.host && self.port == other.port
  }
}

impl fmt::Debug for RequestHead {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestHead")
      .field("method", &self.method)
      .field("host", &self.host)
      .field("port", &self.port)
      .field("origin_form", &self.origin_form)
      .field("raw", &String::from_utf8_lossy(&self.raw))
      .finish()
  }
}

/// `host[:port]`, accepting bracketed IPv6 literals.
fn parse_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
  let (host, port) = if let Some(rest) = target.strip_prefix('[') {
    let (host, rest) = rest
      .split_once(']')
      .ok_or_else(|| Error::parse_error(format!("unterminated IPv6 literal: {}", target)))?;
    match rest.strip_prefix(':') {
      Some(port) => (host, Some(port)),
      None if rest.is_empty() => (host, None),
      None => return Err(Error::parse_error(format!("invalid target: {}", target))),
    }
  } else {
    match target.rsplit_once(':') {
      Some((host, port)) => (host, Some(port)),
      None => (target, None),
    }
  };
  if host.is_empty() {
    return Err(Error::parse_error(format!("empty host in target: {:?}", target)));
  }
  let port = match port {
    None => default_port,
    Some(port) => parse_port(port)?,
  };
  Ok((host.to_string(), port))
}

fn parse_port(port: &str) -> Result<u16> {
  match port.parse::<u16>() {
    Ok(p) if p != 0 => Ok(p),
    _ => Err(Error::parse_error(format!("invalid port: {:?}", port))),
  }
}

fn parse_absolute_uri(target: &str) -> Result<(String, u16)> {
  let uri: http::Uri = target
    .parse()
    .map_err(|e| Error::parse_error(format!("invalid request target {:?}: {}", target, e)))?;
  if uri.scheme().is_none() {
    return Err(Error::parse_error(format!(
      "request target is not an absolute URI: {:?}",
      target
    )));
  }
  let host = uri
    .host()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::parse_error(format!("request target has no host: {:?}", target)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let port = match uri.port() {
    Some(port) => parse_port(port.as_str())?,
    None => match uri.scheme_str() {
      Some("https") => 443,
      _ => 80,
    },
  };
  Ok((host.to_string(), port))
}
