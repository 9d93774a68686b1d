mod buffer_pool;
mod cache;
mod config;
mod engine;
mod limiter;
mod matcher;
mod pipeline;
mod server;
mod transport;
mod upstreams;
mod watcher;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::load_config;
use crate::engine::{CompiledConfig, Engine};

#[derive(Parser, Debug)]
#[command(author, version, about = "kixdns: recursive-style DNS forwarder with hot-reload pipelines", long_about = None)]
struct Args {
    /// Path to the pipeline configuration file (JSON).
    #[arg(short = 'c', long = "config", default_value = "config/pipeline.json")]
    config: PathBuf,
    /// Enables debug-level logging.
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (default: CPU core count).
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind_udp")?;
    let bind_tcp: SocketAddr = cfg.settings.bind_tcp.parse().context("parse bind_tcp")?;
    let bind_dot = cfg
        .settings
        .bind_dot
        .as_deref()
        .map(|s| s.parse::<SocketAddr>())
        .transpose()
        .context("parse bind_dot")?;
    let bind_doh = cfg
        .settings
        .bind_doh
        .as_deref()
        .map(|s| s.parse::<SocketAddr>())
        .transpose()
        .context("parse bind_doh")?;
    let tls_cert_path = cfg.settings.tls_cert_path.clone();
    let tls_key_path = cfg.settings.tls_key_path.clone();

    let compiled = CompiledConfig::compile(cfg).context("compile pipeline config")?;
    let shared = Arc::new(ArcSwap::from_pointee(compiled));

    let engine = Engine::new(shared.clone(), "default".to_string()).context("construct engine")?;

    watcher::spawn(args.config.clone(), shared.clone());
    spawn_cache_sweeper(engine.clone(), engine.cache_sweep_interval_secs());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        bind_udp = %bind_udp,
        bind_tcp = %bind_tcp,
        bind_dot = ?bind_dot,
        bind_doh = ?bind_doh,
        udp_workers,
        "dns forwarder starting"
    );

    let mut handles = server::udp::spawn(bind_udp, udp_workers, engine.clone())
        .await
        .context("start udp listeners")?;
    handles.push(server::tcp::spawn(bind_tcp, engine.clone()).await.context("start tcp listener")?);

    match (bind_dot, &tls_cert_path, &tls_key_path) {
        (Some(addr), Some(cert), Some(key)) => {
            handles.push(
                server::dot::spawn(addr, cert, key, engine.clone())
                    .await
                    .context("start dot listener")?,
            );
        }
        (Some(_), _, _) => warn!("bind_dot configured without tls_cert_path/tls_key_path, skipping DoT listener"),
        (None, _, _) => {}
    }

    match (bind_doh, &tls_cert_path, &tls_key_path) {
        (Some(addr), Some(cert), Some(key)) => {
            handles.push(
                server::doh::spawn(addr, cert, key, engine.clone())
                    .await
                    .context("start doh listener")?,
            );
        }
        (Some(_), _, _) => warn!("bind_doh configured without tls_cert_path/tls_key_path, skipping DoH listener"),
        (None, _, _) => {}
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn spawn_cache_sweeper(engine: Engine, interval_secs: i64) {
    let interval = Duration::from_secs(interval_secs.max(1) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = engine.sweep_cache();
            if removed > 0 {
                tracing::debug!(removed, "swept expired cache entries");
            }
        }
    });
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_level(debug);
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
