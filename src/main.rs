use anyhow::Context;
use clap::Parser;
use sslproxy::{CertificateAuthority, ProxyConfig, ProxyServer, RootTrust, Upstream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
  /// Log at DEBUG level instead of ERROR
  #[arg(short, long)]
  debug: bool,

  /// Send traffic through an upstream proxy
  #[arg(short = 'P', long = "upstream_proxy", value_name = "HOST:PORT")]
  upstream_proxy: Option<Upstream>,

  /// Listening port
  #[arg(short, long, default_value_t = 8008)]
  port: u16,

  /// Listening address
  #[arg(short, long, default_value = "0.0.0.0")]
  bind: String,

  /// Transparent mode: never re-route a connection to another host
  #[arg(short, long)]
  invisible: bool,

  /// Root private key (PKCS#8 PEM); generated with the certificate if both are missing
  #[arg(long, default_value = "root.key")]
  root_key: PathBuf,

  /// Root certificate (PEM)
  #[arg(long, default_value = "root.pem")]
  root_cert: PathBuf,

  /// Seconds to wait when dialing an origin or upstream
  #[arg(long, value_name = "SECS")]
  connect_timeout: Option<u64>,

  /// Seconds a relay side may stay silent before the connection is dropped
  #[arg(long, value_name = "SECS")]
  idle_timeout: Option<u64>,
}

impl Args {
  fn config(&self) -> ProxyConfig {
    let idle = self.idle_timeout.map(Duration::from_secs);
    ProxyConfig {
      invisible: self.invisible,
      upstream: self.upstream_proxy.clone(),
      connect_timeout: self.connect_timeout.map(Duration::from_secs),
      read_timeout: idle,
      write_timeout: idle,
    }
  }

  fn listen_addr(&self) -> String {
    if self.bind.contains(':') {
      format!("[{}]:{}", self.bind, self.port)
    } else {
      format!("{}:{}", self.bind, self.port)
    }
  }
}

fn init_tracing(debug: bool) {
  let level = if debug { "debug" } else { "error" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
    .with_target(false)
    .compact()
    .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  init_tracing(args.debug);

  let root = RootTrust::load_or_generate(&args.root_key, &args.root_cert)
    .await
    .with_context(|| {
      format!(
        "loading root from {} and {}",
        args.root_key.display(),
        args.root_cert.display()
      )
    })?;
  let ca = Arc::new(CertificateAuthority::new(root));

  let addr = args.listen_addr();
  if let Some(upstream) = &args.upstream_proxy {
    tracing::info!(%upstream, "chaining through upstream proxy");
  }
  ProxyServer::new(args.config(), ca)
    .run(addr.clone())
    .await
    .with_context(|| format!("serving on {}", addr))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let args = Args::try_parse_from(["sslproxy"]).unwrap();
    assert!(!args.debug);
    assert_eq!(args.listen_addr(), "0.0.0.0:8008");
    let config = args.config();
    assert!(config.retarget_enabled());
    assert!(config.read_timeout.is_none());
    assert!(config.connect_timeout.is_none());
  }

  #[test]
  fn upstream_flag_parses_host_port() {
    let args = Args::try_parse_from(["sslproxy", "-d", "-P", "10.0.0.1:3128"]).unwrap();
    assert!(args.debug);
    let config = args.config();
    assert_eq!(config.upstream, Some(Upstream::new("10.0.0.1", 3128)));
    assert!(!config.retarget_enabled());

    let long = Args::try_parse_from(["sslproxy", "--upstream_proxy", "proxy.local:8080"]).unwrap();
    assert_eq!(long.upstream_proxy.unwrap().port(), 8080);
  }

  #[test]
  fn malformed_upstream_is_a_usage_error() {
    assert!(Args::try_parse_from(["sslproxy", "-P", "no-port"]).is_err());
  }

  #[test]
  fn timeouts_and_bind() {
    let args = Args::try_parse_from([
      "sslproxy",
      "-b",
      "::1",
      "-p",
      "9000",
      "-i",
      "--connect-timeout",
      "5",
      "--idle-timeout",
      "30",
    ])
    .unwrap();
    assert_eq!(args.listen_addr(), "[::1]:9000");
    let config = args.config();
    assert!(config.invisible);
    assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
    assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.write_timeout, Some(Duration::from_secs(30)));
  }
}
