#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # sslproxy
//!
//! A TLS-intercepting forward proxy. Clients that trust the proxy's root
//! certificate can be inspected in the clear: the proxy terminates the
//! client's TLS session with a certificate forged for the origin's subject,
//! opens its own connection to the origin (or to a chained upstream proxy)
//! and logs the decrypted traffic in both directions.
//!
//! - Explicit `CONNECT` tunnels and plain absolute-URI requests
//! - Forged leaf certificates, generated once per origin subject
//! - Re-routing when a client reuses a connection for another host
//! - Optional single-hop upstream proxy
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use sslproxy::{CertificateAuthority, ProxyConfig, ProxyServer, RootTrust};
//! use std::sync::Arc;
//!
//! # async fn run() -> sslproxy::Result<()> {
//! let root = RootTrust::load_or_generate("root.key", "root.pem").await?;
//! let ca = Arc::new(CertificateAuthority::new(root));
//! ProxyServer::new(ProxyConfig::default(), ca)
//!   .run("127.0.0.1:8008")
//!   .await
//! # }
//! ```
//!
//! ## Upstream proxy
//!
//! With an upstream configured, decrypted tunnel traffic and plain requests
//! are written to the upstream instead of the origin. The origin is still
//! contacted once per tunnel to learn which subject to impersonate.
//!
//! ```rust
//! let config = sslproxy::ProxyConfig {
//!   upstream: Some("127.0.0.1:3128".parse().unwrap()),
//!   ..Default::default()
//! };
//! assert!(!config.retarget_enabled());
//! ```

mod ca;
mod connector;
mod errors;
mod handler;
mod proxy;
mod relay;
mod request;
mod server;
mod socket;
pub mod tls;

pub use ca::{CertificateAuthority, ForgedIdentity, RootTrust};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use handler::{ConnectionHandler, CONNECTION_ESTABLISHED};
pub use proxy::{ProxyConfig, Upstream};
pub use relay::{relay, RelayOutcome, Session};
pub use request::{RequestHead, MAX_HEAD_SIZE};
pub use server::{BoundProxy, ProxyServer};
pub use socket::{AsyncStream, BoxedStream, Chunk, Socket, CHUNK_SIZE};
