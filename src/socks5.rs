use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::accountant::Accountant;
use crate::config::{Config, IpPool};
use crate::dial;
use crate::error::SessionError;
use crate::relay;
use crate::sticky;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CONNECT_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Drive one SOCKS5 connection end-to-end: greeting, optional user/pass
/// auth, the CONNECT request, dial, reply, and finally the relay. RFC
/// 1928/1929, CONNECT only — BIND and UDP ASSOCIATE are refused with
/// `REP=7`; unsupported ATYPs close the connection silently.
pub async fn handle(
    mut client: TcpStream,
    cfg: &Config,
    pool: &IpPool,
    accountant: &Accountant,
) -> Result<(), SessionError> {
    let username = negotiate(&mut client, cfg).await?;

    let bind_ip = sticky::resolve(&username, cfg.socks_username(), pool).map(str::to_string);
    info!(user = %username, bound_ip = bind_ip.as_deref().unwrap_or("default"), "socks5 authenticated");
    accountant.record_connection();

    let (cmd, host, port) = read_request(&mut client).await?;
    if cmd != CMD_CONNECT {
        let _ = client.write_all(&error_reply(REP_COMMAND_NOT_SUPPORTED)).await;
        return Err(SessionError::Unsupported(format!("SOCKS5 CMD {cmd:#x}")));
    }

    let target_host = dial::nat64_rewrite(&host, cfg.ipv6_only());

    let outcome = match dial::connect(bind_ip.as_deref(), &target_host, port, dial::CONNECT_TIMEOUT).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = client.write_all(&error_reply(REP_CONNECT_REFUSED)).await;
            return Err(err);
        }
    };

    let local_addr = outcome
        .stream
        .local_addr()
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    client
        .write_all(&success_reply(local_addr))
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))?;

    let stats = relay::run(client, outcome.stream, relay::IDLE_TIMEOUT).await;
    accountant.record_upstream(stats.bytes_up);
    accountant.record_downstream(stats.bytes_down);
    info!(user = %username, bytes_up = stats.bytes_up, bytes_down = stats.bytes_down, "socks5 session ended");
    Ok(())
}

async fn read_timeout(stream: &mut TcpStream, n: usize) -> Result<Vec<u8>, SessionError> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| SessionError::Protocol("timed out waiting for client".into()))?
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    Ok(buf)
}

async fn negotiate(client: &mut TcpStream, cfg: &Config) -> Result<String, SessionError> {
    let header = read_timeout(client, 2).await?;
    if header[0] != VERSION {
        return Err(SessionError::Protocol("bad SOCKS version in greeting".into()));
    }
    let nmethods = header[1] as usize;
    let methods = read_timeout(client, nmethods).await?;

    let password = cfg.socks_password();
    let offers = |m: u8| methods.contains(&m);

    if !password.is_empty() && offers(METHOD_USER_PASS) {
        client
            .write_all(&[VERSION, METHOD_USER_PASS])
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        auth_subnegotiation(client, password).await
    } else if password.is_empty() && offers(METHOD_NO_AUTH) {
        client
            .write_all(&[VERSION, METHOD_NO_AUTH])
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        Ok("anon".to_string())
    } else {
        let _ = client.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await;
        Err(SessionError::Unsupported("no acceptable auth method".into()))
    }
}

async fn auth_subnegotiation(client: &mut TcpStream, password: &str) -> Result<String, SessionError> {
    let sub = read_timeout(client, 2).await?;
    if sub[0] != 0x01 {
        return Err(SessionError::Protocol("bad auth subnegotiation version".into()));
    }
    let ulen = sub[1] as usize;
    let uname_bytes = read_timeout(client, ulen).await?;
    let username = String::from_utf8_lossy(&uname_bytes).to_string();

    let plen = read_timeout(client, 1).await?[0] as usize;
    let pass_bytes = read_timeout(client, plen).await?;
    let sent_password = String::from_utf8_lossy(&pass_bytes).to_string();

    if sent_password != password {
        let _ = client.write_all(&[0x01, 0x01]).await;
        warn!(user = %username, "socks5 auth failed");
        return Err(SessionError::Auth { user: username });
    }
    client
        .write_all(&[0x01, 0x00])
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    Ok(username)
}

async fn read_request(client: &mut TcpStream) -> Result<(u8, String, u16), SessionError> {
    let header = read_timeout(client, 4).await?;
    if header[0] != VERSION {
        return Err(SessionError::Protocol("bad SOCKS version in request".into()));
    }
    let cmd = header[1];
    let atyp = header[3];

    let host = match atyp {
        ATYP_V4 => {
            let b = read_timeout(client, 4).await?;
            Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string()
        }
        ATYP_DOMAIN => {
            let len = read_timeout(client, 1).await?[0] as usize;
            let b = read_timeout(client, len).await?;
            String::from_utf8_lossy(&b).to_string()
        }
        ATYP_V6 => {
            let b = read_timeout(client, 16).await?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&b);
            Ipv6Addr::from(raw).to_string()
        }
        _ => return Err(SessionError::Unsupported(format!("ATYP {atyp:#x}"))),
    };

    let port_bytes = read_timeout(client, 2).await?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    Ok((cmd, host, port))
}

#[allow(dead_code)]
fn is_ipv4_literal(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

fn success_reply(local: std::net::SocketAddr) -> Vec<u8> {
    let mut reply = vec![VERSION, REP_SUCCESS, 0x00];
    match local {
        std::net::SocketAddr::V4(v4) => {
            reply.push(ATYP_V4);
            reply.extend_from_slice(&v4.ip().octets());
        }
        std::net::SocketAddr::V6(v6) => {
            reply.push(ATYP_V6);
            reply.extend_from_slice(&v6.ip().octets());
        }
    }
    reply.extend_from_slice(&local.port().to_be_bytes());
    reply
}

fn error_reply(rep: u8) -> Vec<u8> {
    let mut reply = vec![VERSION, rep, 0x00, ATYP_V4];
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&[0, 0]);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn anon_fallback_skips_auth_subnegotiation() {
        let (mut test_client, mut proxy_side) = tcp_pair().await;
        let cfg = Config::parse("SOCKS_USERNAME=user\nSOCKS_PASSWORD=\n");

        test_client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let username = negotiate(&mut proxy_side, &cfg).await.unwrap();
        assert_eq!(username, "anon");

        let mut reply = [0u8; 2];
        test_client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn sticky_user_binds_source_and_relays_both_directions() {
        let origin = TcpListener::bind("[::1]:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });

        let (mut test_client, proxy_side) = tcp_pair().await;
        let cfg = Config::parse("SOCKS_USERNAME=user\nSOCKS_PASSWORD=pw\n");
        let pool = IpPool::parse("::1\n");
        let accountant = Accountant::new();

        let handle_task = tokio::spawn(async move { handle(proxy_side, &cfg, &pool, &accountant).await });

        test_client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method_reply = [0u8; 2];
        test_client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x02]);

        let mut auth = vec![0x01, 5];
        auth.extend_from_slice(b"user2");
        auth.push(2);
        auth.extend_from_slice(b"pw");
        test_client.write_all(&auth).await.unwrap();
        let mut auth_reply = [0u8; 2];
        test_client.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x01, 0x00]);

        let mut request = vec![0x05, CMD_CONNECT, 0x00, ATYP_V6];
        if let std::net::IpAddr::V6(v6) = origin_addr.ip() {
            request.extend_from_slice(&v6.octets());
        } else {
            panic!("expected an IPv6 origin address");
        }
        request.extend_from_slice(&origin_addr.port().to_be_bytes());
        test_client.write_all(&request).await.unwrap();

        let mut reply_head = [0u8; 4];
        test_client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head, [0x05, REP_SUCCESS, 0x00, ATYP_V6]);
        let mut reply_tail = [0u8; 18];
        test_client.read_exact(&mut reply_tail).await.unwrap();

        test_client.write_all(b"hello").await.unwrap();
        let mut reply_payload = [0u8; 5];
        test_client.read_exact(&mut reply_payload).await.unwrap();
        assert_eq!(&reply_payload, b"world");

        drop(test_client);
        let result = handle_task.await.unwrap();
        assert!(result.is_ok());
        origin_task.await.unwrap();
    }

    #[test]
    fn success_reply_renders_v4() {
        let addr: std::net::SocketAddr = "1.2.3.4:5555".parse().unwrap();
        let reply = success_reply(addr);
        assert_eq!(reply, vec![5, 0, 0, 1, 1, 2, 3, 4, 0x15, 0xB3]);
    }

    #[test]
    fn success_reply_renders_v6() {
        let addr: std::net::SocketAddr = "[2001:db8::b]:443".parse().unwrap();
        let reply = success_reply(addr);
        assert_eq!(reply[0..4], [5, 0, 0, 4]);
        assert_eq!(reply.len(), 4 + 16 + 2);
    }

    #[test]
    fn error_reply_is_zero_v4() {
        let reply = error_reply(REP_CONNECT_REFUSED);
        assert_eq!(reply, vec![5, 5, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn ipv4_literal_detection() {
        assert!(is_ipv4_literal("1.2.3.4"));
        assert!(!is_ipv4_literal("example.com"));
        assert!(!is_ipv4_literal("2001:db8::1"));
    }
}
