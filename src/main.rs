//! stockpile - S3-backed build cache, module cache, and reverse proxy.

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockpile::build::{BuildCache, BuildCacheConfig};
use stockpile::config::Args;
use stockpile::metrics::Registry;
use stockpile::module::{ModuleCache, ModuleCacheConfig};
use stockpile::protocol::ProtocolServer;
use stockpile::revproxy::connect::{load_tls_acceptor, serve_bridge, ConnectBridge};
use stockpile::revproxy::{ProxyConfig, ProxyServer};
use stockpile::s3::{join_key, ObjectStore, S3Store};
use stockpile::server::{self, AppState};
use stockpile::stage::CacheDir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stockpile={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {e}");
        std::process::exit(1);
    }

    let cache_dir = args.cache_dir.clone().context("cache dir not set")?;
    let bucket = args.bucket.clone().context("bucket not set")?;

    let region = match &args.region {
        Some(region) => region.clone(),
        None => S3Store::bucket_region(&bucket)
            .await
            .context("resolve bucket region")?,
    };

    info!("======================================");
    info!("  stockpile - S3-backed build cache");
    info!("======================================");
    info!("Local cache: {}", cache_dir.display());
    info!("S3 bucket: {bucket} ({region})");
    if let Some(http) = args.http {
        info!("HTTP: {http}");
    }
    info!("======================================");

    let aws = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region))
        .load()
        .await;
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(aws_sdk_s3::Client::new(&aws), &bucket));

    let stage = Arc::new(CacheDir::new(&cache_dir).context("create local cache")?);
    let build = Arc::new(BuildCache::new(
        Arc::clone(&stage),
        Arc::clone(&store),
        BuildCacheConfig {
            key_prefix: args.key_prefix.clone(),
            min_upload_size: args.min_upload_size,
            upload_concurrency: args.upload_concurrency,
            upload_timeout: Duration::from_secs(args.upload_timeout_seconds),
        },
    ));

    let registry = Arc::new(Registry::new());
    {
        let metrics = build.metrics();
        registry.publish("build_cache", move || {
            serde_json::to_value(&*metrics).unwrap_or_default()
        });
    }

    // Scheduled cleanup of the local stage.
    if args.expiration_seconds > 0 {
        let expiration = Duration::from_secs(args.expiration_seconds);
        let interval = Duration::from_secs(args.expiration_seconds.min(3600));
        let stage = Arc::clone(&stage);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match stage.cleanup_older_than(expiration).await {
                    Ok(removed) if removed > 0 => info!(removed, "local cache cleanup"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "local cache cleanup failed"),
                }
            }
        });
        info!(
            expiration_secs = args.expiration_seconds,
            "local cache expiration enabled"
        );
    }

    // Optional HTTP surface: module proxy, reverse proxy, debug endpoints.
    let mut module_cache = None;
    let mut proxy_server = None;
    if let Some(listen) = args.http {
        if args.modproxy {
            let module = Arc::new(ModuleCache::new(
                cache_dir.join("module"),
                Arc::clone(&store),
                ModuleCacheConfig {
                    key_prefix: join_key([args.key_prefix.as_str(), "module"]),
                    max_tasks: args.upload_concurrency,
                    upload_timeout: Duration::from_secs(args.upload_timeout_seconds),
                    log_requests: args.debug_log,
                },
            ));
            let metrics = module.metrics();
            registry.publish("modcache", move || {
                serde_json::to_value(&*metrics).unwrap_or_default()
            });
            info!("module proxy enabled at /mod/");
            module_cache = Some(module);
        }

        let mut bridge = None;
        let targets = args.revproxy_targets();
        if !targets.is_empty() {
            let proxy = Arc::new(
                ProxyServer::new(
                    cache_dir.join("revproxy"),
                    Arc::clone(&store),
                    ProxyConfig {
                        targets: targets.clone(),
                        key_prefix: join_key([args.key_prefix.as_str(), "revproxy"]),
                        upload_concurrency: args.upload_concurrency,
                        upload_timeout: Duration::from_secs(args.upload_timeout_seconds),
                    },
                )
                .context("create reverse proxy")?,
            );
            let metrics = proxy.metrics();
            registry.publish("revcache", move || {
                serde_json::to_value(&*metrics).unwrap_or_default()
            });

            let (cert, key) = (
                args.tls_cert.clone().context("TLS cert not set")?,
                args.tls_key.clone().context("TLS key not set")?,
            );
            let acceptor = load_tls_acceptor(&cert, &key).context("load TLS configuration")?;

            let (connect, queue) = ConnectBridge::new(targets.clone(), !args.no_forward_connect);
            let bridge_metrics = connect.metrics();
            registry.publish("proxyconn", move || {
                serde_json::to_value(&*bridge_metrics).unwrap_or_default()
            });

            // The internal TLS server does not listen on a real socket; it
            // serves connections hijacked from CONNECT requests.
            tokio::spawn(serve_bridge(queue, acceptor, Arc::clone(&proxy)));

            info!(targets = targets.join(","), "reverse proxy enabled");
            bridge = Some(Arc::new(connect));
            proxy_server = Some(proxy);
        }

        let state = Arc::new(AppState {
            listen,
            registry: Arc::clone(&registry),
            module: module_cache.clone(),
            module_upstream: args.mod_upstream.clone(),
            proxy: proxy_server.clone(),
            bridge,
            client: reqwest::Client::builder()
                .build()
                .context("build HTTP client")?,
        });
        tokio::spawn(async move {
            if let Err(e) = server::run(state).await {
                error!(error = %e, "HTTP server failed");
                std::process::exit(1);
            }
        });
    }

    if args.serve_only {
        tokio::signal::ctrl_c().await.context("wait for shutdown")?;
        info!("shutting down");
    } else {
        // Speak the toolchain protocol until the toolchain hangs up.
        let protocol = ProtocolServer::new(Arc::clone(&build), args.max_requests);
        protocol
            .serve(tokio::io::stdin(), tokio::io::stdout())
            .await
            .context("toolchain protocol")?;
    }

    // Drain background work before exit.
    build.close().await;
    if let Some(module) = module_cache {
        module.close().await;
    }
    if let Some(proxy) = proxy_server {
        proxy.close().await;
    }
    if args.expiration_seconds > 0 {
        let _ = stage
            .cleanup_older_than(Duration::from_secs(args.expiration_seconds))
            .await;
    }

    Ok(())
}
