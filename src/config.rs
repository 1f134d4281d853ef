//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::types::{Error, Result};

/// stockpile - S3-backed build cache, module cache, and caching reverse proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "stockpile", version)]
#[command(about = "Caches toolchain builds, module artifacts, and proxied responses in S3")]
pub struct Args {
    /// Local cache directory where actions and objects are staged
    #[arg(long, env = "STOCKPILE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// S3 bucket backing the caches
    #[arg(long, env = "STOCKPILE_S3_BUCKET")]
    pub bucket: Option<String>,

    /// S3 region; resolved from the bucket location when unset
    #[arg(long, env = "STOCKPILE_S3_REGION")]
    pub region: Option<String>,

    /// Prefix prepended to every remote key, with an intervening slash
    #[arg(long, env = "STOCKPILE_KEY_PREFIX", default_value = "")]
    pub key_prefix: String,

    /// Objects smaller than this many bytes are not written to S3
    #[arg(long, env = "STOCKPILE_MIN_UPLOAD_SIZE", default_value_t = 0)]
    pub min_upload_size: u64,

    /// Maximum concurrent background uploads (0 = one per CPU)
    #[arg(long, env = "STOCKPILE_UPLOAD_CONCURRENCY", default_value_t = 0)]
    pub upload_concurrency: usize,

    /// Timeout for a single background upload, in seconds (floor 60)
    #[arg(long, env = "STOCKPILE_UPLOAD_TIMEOUT_SECONDS", default_value_t = 60)]
    pub upload_timeout_seconds: u64,

    /// Remove local cache entries older than this many seconds (0 = never)
    #[arg(long, env = "STOCKPILE_EXPIRATION_SECONDS", default_value_t = 0)]
    pub expiration_seconds: u64,

    /// Maximum concurrent toolchain requests (0 = one per CPU)
    #[arg(long, env = "STOCKPILE_MAX_REQUESTS", default_value_t = 0)]
    pub max_requests: usize,

    /// HTTP listen address for the module proxy, reverse proxy, and debug
    /// endpoints
    #[arg(long, env = "STOCKPILE_HTTP")]
    pub http: Option<SocketAddr>,

    /// Serve the module cache under /mod/ (requires --http)
    #[arg(long, env = "STOCKPILE_MODPROXY")]
    pub modproxy: bool,

    /// Upstream module proxy faulted into the module cache on miss
    #[arg(long, env = "STOCKPILE_MOD_UPSTREAM")]
    pub mod_upstream: Option<String>,

    /// Comma-separated reverse-proxy targets: exact hostnames or *.domain
    /// patterns (requires --http and the TLS flags)
    #[arg(long, env = "STOCKPILE_REVPROXY")]
    pub revproxy: Option<String>,

    /// PEM certificate chain for the HTTPS-terminating bridge
    #[arg(long, env = "STOCKPILE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the HTTPS-terminating bridge
    #[arg(long, env = "STOCKPILE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Refuse CONNECTs for unlisted hosts instead of tunneling them to
    /// their targets
    #[arg(long, env = "STOCKPILE_NO_FORWARD_CONNECT")]
    pub no_forward_connect: bool,

    /// Serve HTTP only; do not speak the toolchain protocol on stdio
    #[arg(long, env = "STOCKPILE_SERVE_ONLY")]
    pub serve_only: bool,

    /// Detailed (noisy) per-request logging
    #[arg(long, env = "STOCKPILE_DEBUG")]
    pub debug_log: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STOCKPILE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Check cross-flag requirements. Called once at startup; failures are
    /// operator errors, not runtime conditions.
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.is_none() {
            return Err(Error::Config("--cache-dir is required".into()));
        }
        if self.bucket.is_none() {
            return Err(Error::Config("--bucket is required".into()));
        }
        if self.modproxy && self.http.is_none() {
            return Err(Error::Config("--modproxy requires --http".into()));
        }
        if self.revproxy.is_some() {
            if self.http.is_none() {
                return Err(Error::Config("--revproxy requires --http".into()));
            }
            if self.tls_cert.is_none() || self.tls_key.is_none() {
                return Err(Error::Config(
                    "--revproxy requires --tls-cert and --tls-key".into(),
                ));
            }
        }
        if self.serve_only && self.http.is_none() {
            return Err(Error::Config("--serve-only requires --http".into()));
        }
        Ok(())
    }

    /// The reverse-proxy target list, split and trimmed.
    pub fn revproxy_targets(&self) -> Vec<String> {
        self.revproxy
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}
