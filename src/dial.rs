use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::anyhow;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::warn;

use crate::error::SessionError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a dial attempt: the connected stream plus whether the
/// requested source address was actually applied (it degrades to the
/// default route on bind failure rather than failing the session, per
/// the sticky-binding design note).
pub struct DialOutcome {
    pub stream: TcpStream,
    pub bound: bool,
}

fn target_is_ipv6_literal(host: &str) -> bool {
    host.contains(':')
}

/// Open an outbound TCP connection, optionally bound to `bind_ip`.
///
/// Address family: `bind_ip` present forces IPv6; otherwise an IPv6-literal
/// `host` forces IPv6; otherwise IPv4, letting DNS resolution pick among A
/// records. A bind failure is logged and the dial proceeds unbound rather
/// than failing outright.
pub async fn connect(
    bind_ip: Option<&str>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<DialOutcome, SessionError> {
    let target_label = format!("{host}:{port}");
    let want_v6 = bind_ip.is_some() || target_is_ipv6_literal(host);

    let resolved: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| SessionError::Dial {
            target: target_label.clone(),
            source: e.into(),
        })?
        .filter(|a| a.is_ipv6() == want_v6)
        .collect();

    let target = resolved.into_iter().next().ok_or_else(|| SessionError::Dial {
        target: target_label.clone(),
        source: anyhow!(
            "no {} address found for {host}",
            if want_v6 { "AAAA" } else { "A" }
        ),
    })?;

    let socket = if want_v6 { TcpSocket::new_v6() } else { TcpSocket::new_v4() }.map_err(|e| {
        SessionError::Dial {
            target: target_label.clone(),
            source: e.into(),
        }
    })?;
    socket.set_reuseaddr(true).ok();

    let mut bound = false;
    if let Some(bind_ip) = bind_ip {
        match bind_ip.parse::<IpAddr>() {
            Ok(ip) => match socket.bind(SocketAddr::new(ip, 0)) {
                Ok(()) => bound = true,
                Err(err) => warn!(bind_ip, error = %err, "bind to sticky source failed, degrading to default route"),
            },
            Err(err) => warn!(bind_ip, error = %err, "sticky source is not a valid address, degrading to default route"),
        }
    }

    let stream = tokio::time::timeout(timeout, socket.connect(target))
        .await
        .map_err(|_| SessionError::Dial {
            target: target_label.clone(),
            source: anyhow!("connect timed out after {timeout:?}"),
        })?
        .map_err(|e| SessionError::Dial {
            target: target_label,
            source: e.into(),
        })?;

    if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60))) {
        warn!(error = %err, "failed to set keepalive on outbound socket");
    }

    Ok(DialOutcome { stream, bound })
}

/// NAT64 rewrite: embed an IPv4 literal into the well-known `64:ff9b::/96`
/// prefix so an IPv6-only uplink can reach it. A no-op for anything that
/// isn't an IPv4 literal (domain names are left for the resolver to return
/// AAAA for).
pub fn nat64_rewrite(host: &str, ipv6_only: bool) -> String {
    if !ipv6_only {
        return host.to_string();
    }
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(v4) => format!("64:ff9b::{v4}"),
        Err(_) => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat64_rewrites_ipv4_literal() {
        assert_eq!(nat64_rewrite("1.2.3.4", true), "64:ff9b::1.2.3.4");
    }

    #[test]
    fn nat64_noop_when_disabled() {
        assert_eq!(nat64_rewrite("1.2.3.4", false), "1.2.3.4");
    }

    #[test]
    fn nat64_noop_for_domain_names() {
        assert_eq!(nat64_rewrite("example.com", true), "example.com");
    }

    #[test]
    fn nat64_noop_for_ipv6_literal() {
        assert_eq!(nat64_rewrite("2001:db8::1", true), "2001:db8::1");
    }
}
