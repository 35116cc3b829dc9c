mod accountant;
mod config;
mod dial;
mod error;
mod http_proxy;
mod listener;
mod logging;
mod relay;
mod socks5;
mod sticky;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use accountant::Accountant;
use config::Config;

struct Args {
    config_path: PathBuf,
    pool_path: PathBuf,
    stats_path: PathBuf,
    socks_listen: Option<SocketAddr>,
    http_listen: Option<SocketAddr>,
}

fn env_or_default(key: &str, default: &str) -> PathBuf {
    std::env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

/// Hand-rolled `--flag value` / `--flag=value` parsing, matching the
/// teacher's own `main.rs` rather than pulling in a CLI framework for five
/// optional flags.
fn parse_args() -> Args {
    let mut config_path = env_or_default("STICKY_PROXY_CONFIG", "config.cfg");
    let mut pool_path = env_or_default("STICKY_PROXY_POOL", "added_ips.txt");
    let mut stats_path = env_or_default("STICKY_PROXY_STATS", "stats.json");
    let mut socks_listen: Option<SocketAddr> = None;
    let mut http_listen: Option<SocketAddr> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v.into();
                }
            }
            "--pool" => {
                if let Some(v) = args.next() {
                    pool_path = v.into();
                }
            }
            "--stats" => {
                if let Some(v) = args.next() {
                    stats_path = v.into();
                }
            }
            "--socks-listen" => {
                if let Some(v) = args.next() {
                    socks_listen = v.parse().ok();
                }
            }
            "--http-listen" => {
                if let Some(v) = args.next() {
                    http_listen = v.parse().ok();
                }
            }
            other => {
                if let Some(v) = other.strip_prefix("--config=") {
                    config_path = v.into();
                } else if let Some(v) = other.strip_prefix("--pool=") {
                    pool_path = v.into();
                } else if let Some(v) = other.strip_prefix("--stats=") {
                    stats_path = v.into();
                } else if let Some(v) = other.strip_prefix("--socks-listen=") {
                    socks_listen = v.parse().ok();
                } else if let Some(v) = other.strip_prefix("--http-listen=") {
                    http_listen = v.parse().ok();
                }
            }
        }
    }

    Args {
        config_path,
        pool_path,
        stats_path,
        socks_listen,
        http_listen,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = parse_args();

    let initial_cfg = Config::load(&args.config_path).await;
    let socks_addr = args
        .socks_listen
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], initial_cfg.local_socks_port())));
    let http_addr = args
        .http_listen
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], initial_cfg.local_http_port())));

    info!(
        version = env!("STICKY_PROXY_VERSION"),
        socks_addr = %socks_addr,
        http_addr = %http_addr,
        base_user = initial_cfg.socks_username(),
        ipv6_only = initial_cfg.ipv6_only(),
        "starting sticky-egress-proxy"
    );

    let accountant = Accountant::new();
    let shutdown = CancellationToken::new();

    let socks_task = tokio::spawn(listener::run_socks5(
        socks_addr,
        args.config_path.clone(),
        args.pool_path.clone(),
        accountant.clone(),
        shutdown.clone(),
    ));
    let http_task = tokio::spawn(listener::run_http(
        http_addr,
        args.config_path.clone(),
        args.pool_path.clone(),
        accountant.clone(),
        shutdown.clone(),
    ));
    let reporter_task = tokio::spawn(accountant.clone().run_reporter(
        args.stats_path.clone(),
        Duration::from_secs(60),
        shutdown.clone(),
    ));

    install_signal_handlers(shutdown.clone());

    // Each listener only returns once `shutdown` is cancelled, except on a
    // startup/bind failure, which returns immediately. Whichever task
    // finishes first — for either reason — must cancel `shutdown` so its
    // sibling doesn't run forever waiting on a connection that will never
    // come.
    let mut socks_task = socks_task;
    let mut http_task = http_task;
    let (socks_result, http_result) = tokio::select! {
        result = &mut socks_task => {
            shutdown.cancel();
            (result, http_task.await)
        }
        result = &mut http_task => {
            shutdown.cancel();
            (socks_task.await, result)
        }
    };
    let _ = reporter_task.await;

    let mut exit_code = 0;
    for (label, result) in [("socks5", socks_result), ("http", http_result)] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(listener = label, error = %err, "listener exited with a startup/bind failure");
                exit_code = 1;
            }
            Err(join_err) => {
                error!(listener = label, error = %join_err, "listener task panicked");
                exit_code = 1;
            }
        }
    }

    info!("shutdown complete");
    std::process::exit(exit_code);
}

/// Install SIGINT/SIGTERM handlers that cancel the shared shutdown token.
/// Cancelling is idempotent: a second signal just cancels an
/// already-cancelled token, which is a no-op, matching "sending SIGTERM
/// twice has the same effect as once."
fn install_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    shutdown.cancel();
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    shutdown.cancel();
                }
            }
        }
    });
}
