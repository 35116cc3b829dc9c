use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accountant::Accountant;
use crate::config::{Config, IpPool};
use crate::error::SessionError;
use crate::{http_proxy, socks5};

/// Roughly matches the original's `ThreadPoolExecutor(max_workers=300)`:
/// a ceiling on concurrently in-flight sessions per listener, enforced
/// with a semaphore rather than a fixed thread count since each session is
/// a lightweight task, not an OS thread.
const MAX_CONCURRENT_SESSIONS: usize = 300;
const BACKLOG: i32 = 128;

/// Bind a IPv4 listening socket with `SO_REUSEADDR` and a fixed backlog.
pub fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

#[derive(Clone, Copy)]
enum Protocol {
    Socks5,
    Http,
}

impl Protocol {
    fn name(self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Http => "http",
        }
    }
}

fn log_session_error(protocol: Protocol, peer: SocketAddr, err: &SessionError) {
    let level = err.log_level();
    if level >= tracing::Level::WARN {
        warn!(protocol = protocol.name(), %peer, error = %err, "session ended with error");
    } else {
        debug!(protocol = protocol.name(), %peer, error = %err, "session ended with error");
    }
}

async fn accept_loop(
    protocol: Protocol,
    listener: TcpListener,
    config_path: PathBuf,
    pool_path: PathBuf,
    accountant: Accountant,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SESSIONS));
    info!(protocol = protocol.name(), addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "listening");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(protocol = protocol.name(), "listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(protocol = protocol.name(), error = %err, "accept error, continuing");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(protocol = protocol.name(), %peer, "worker pool saturated, dropping connection");
                        continue;
                    }
                };

                // Reload-per-accept: each session gets its own immutable
                // snapshot, so config/pool edits and pool rotations take
                // effect starting with the very next accepted connection.
                let cfg = Config::load(&config_path).await;
                let pool = IpPool::load(&pool_path).await;
                let accountant = accountant.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let result = match protocol {
                        Protocol::Socks5 => socks5::handle(stream, &cfg, &pool, &accountant).await,
                        Protocol::Http => http_proxy::handle(stream, &cfg, &pool, &accountant).await,
                    };
                    if let Err(err) = result {
                        log_session_error(protocol, peer, &err);
                    }
                });
            }
        }
    }
}

pub async fn run_socks5(
    addr: SocketAddr,
    config_path: PathBuf,
    pool_path: PathBuf,
    accountant: Accountant,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = bind_listener(addr)?;
    accept_loop(Protocol::Socks5, listener, config_path, pool_path, accountant, shutdown).await;
    Ok(())
}

pub async fn run_http(
    addr: SocketAddr,
    config_path: PathBuf,
    pool_path: PathBuf,
    accountant: Accountant,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = bind_listener(addr)?;
    accept_loop(Protocol::Http, listener, config_path, pool_path, accountant, shutdown).await;
    Ok(())
}
