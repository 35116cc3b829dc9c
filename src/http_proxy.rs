use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::accountant::Accountant;
use crate::config::{Config, IpPool};
use crate::dial;
use crate::error::SessionError;
use crate::relay;
use crate::sticky;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4 * 1024;
const NEGOTIATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

struct ParsedRequest {
    method: String,
    target: String,
    version: String,
    header_lines: Vec<String>,
    body_prefix: Vec<u8>,
}

/// Drive one HTTP proxy connection: parse the first request, authenticate,
/// resolve the sticky binding, then either tunnel (CONNECT) or rewrite and
/// forward (everything else). Per-connection forwarder only — no response
/// parsing, no framing enforcement, no request multiplexing.
pub async fn handle(
    mut client: TcpStream,
    cfg: &Config,
    pool: &IpPool,
    accountant: &Accountant,
) -> Result<(), SessionError> {
    let request = tokio::time::timeout(NEGOTIATION_TIMEOUT, read_request(&mut client))
        .await
        .map_err(|_| SessionError::Protocol("timed out waiting for request headers".into()))??;

    let username = match authenticate(&mut client, cfg, &request.header_lines).await? {
        Some(user) => user,
        None => return Ok(()),
    };

    let bind_ip = sticky::resolve(&username, cfg.socks_username(), pool).map(str::to_string);
    info!(user = %username, bound_ip = bind_ip.as_deref().unwrap_or("default"), "http proxy authenticated");
    accountant.record_connection();

    if request.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, &request, bind_ip.as_deref(), accountant, &username).await
    } else {
        handle_forward(client, &request, bind_ip.as_deref(), accountant, &username).await
    }
}

async fn read_request(client: &mut TcpStream) -> Result<ParsedRequest, SessionError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let header_end = loop {
        let n = client
            .read(&mut chunk)
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        if n == 0 {
            return Err(SessionError::Protocol("client closed before headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_crlf_crlf(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(SessionError::Protocol("headers too large".into()));
        }
    };

    let (header_bytes, body_prefix) = (&buf[..header_end], buf[header_end + 4..].to_vec());
    let header_str = String::from_utf8_lossy(header_bytes).to_string();
    let mut lines = header_str.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| SessionError::Protocol("bad request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| SessionError::Protocol("bad request line".into()))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| SessionError::Protocol("bad request line".into()))?
        .to_string();

    let header_lines: Vec<String> = lines.filter(|l| !l.is_empty()).map(str::to_string).collect();

    Ok(ParsedRequest {
        method,
        target,
        version,
        header_lines,
        body_prefix,
    })
}

fn find_crlf_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Returns `Ok(Some(username))` when the request is allowed through,
/// `Ok(None)` when a `407` was already sent and the caller should just
/// close, or `Err` on a wire-level write failure.
async fn authenticate(client: &mut TcpStream, cfg: &Config, headers: &[String]) -> Result<Option<String>, SessionError> {
    let password = cfg.socks_password();
    let proxy_auth = headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("Proxy-Authorization").then(|| value.trim().to_string())
    });

    match proxy_auth {
        Some(value) => match decode_basic(&value) {
            Some((user, pass)) if pass == password => Ok(Some(user)),
            Some((user, _)) => {
                warn!(user = %user, "http proxy auth failed");
                send_407(client).await?;
                Ok(None)
            }
            None => {
                // Unparseable / non-Basic scheme: treated as absent, see
                // the open question on non-Basic proxy auth.
                if password.is_empty() {
                    Ok(Some("anon".to_string()))
                } else {
                    send_407(client).await?;
                    Ok(None)
                }
            }
        },
        None if password.is_empty() => Ok(Some("anon".to_string())),
        None => {
            send_407(client).await?;
            Ok(None)
        }
    }
}

fn decode_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ").or_else(|| header_value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn send_407(client: &mut TcpStream) -> Result<(), SessionError> {
    let body = b"";
    let resp = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"sticky-egress-proxy\"\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    client
        .write_all(resp.as_bytes())
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))
}

async fn send_502(client: &mut TcpStream) -> Result<(), SessionError> {
    let resp = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
    client.write_all(resp).await.map_err(|e| SessionError::Protocol(e.to_string()))
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    }
}

async fn handle_connect(
    mut client: TcpStream,
    request: &ParsedRequest,
    bind_ip: Option<&str>,
    accountant: &Accountant,
    username: &str,
) -> Result<(), SessionError> {
    let (host, port) = split_host_port(&request.target, 443);

    let outcome = match dial::connect(bind_ip, &host, port, dial::CONNECT_TIMEOUT).await {
        Ok(outcome) => outcome,
        Err(err) => {
            send_502(&mut client).await?;
            return Err(err);
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))?;

    let stats = relay::run(client, outcome.stream, relay::IDLE_TIMEOUT).await;
    accountant.record_upstream(stats.bytes_up);
    accountant.record_downstream(stats.bytes_down);
    info!(user = %username, host = %host, port, bytes_up = stats.bytes_up, bytes_down = stats.bytes_down, "http connect session ended");
    Ok(())
}

/// Parse an absolute-URI request target into (host, port, path[?query]).
fn parse_absolute_uri(target: &str) -> Result<(String, u16, String), SessionError> {
    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| SessionError::Unsupported("non-absolute-URI or https:// request target".into()))?;
    let (authority, path_and_query) = match rest.find('/') {
        Some(pos) => (&rest[..pos], rest[pos..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_host_port(authority, 80);
    Ok((host, port, path_and_query))
}

fn should_drop_header(line: &str) -> bool {
    let Some((name, _)) = line.split_once(':') else {
        return false;
    };
    let lower = name.trim().to_ascii_lowercase();
    lower.starts_with("proxy-auth") || lower == "proxy-connection"
}

/// Rebuild the request line and headers with proxy-specific headers
/// stripped. Idempotent if re-applied to an already-origin-form request
/// whose proxy headers are already gone, since there is nothing left to
/// strip and the request line is already `METHOD path HTTP/1.1`.
fn rebuild_request(method: &str, path_and_query: &str, headers: &[String]) -> String {
    let mut out = format!("{method} {path_and_query} HTTP/1.1\r\n");
    for line in headers {
        if should_drop_header(line) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

async fn handle_forward(
    mut client: TcpStream,
    request: &ParsedRequest,
    bind_ip: Option<&str>,
    accountant: &Accountant,
    username: &str,
) -> Result<(), SessionError> {
    let (host, port, path_and_query) = parse_absolute_uri(&request.target)?;
    let rebuilt = rebuild_request(&request.method, &path_and_query, &request.header_lines);

    let outcome = match dial::connect(bind_ip, &host, port, dial::CONNECT_TIMEOUT).await {
        Ok(outcome) => outcome,
        Err(err) => {
            send_502(&mut client).await?;
            return Err(err);
        }
    };
    let mut remote = outcome.stream;

    remote
        .write_all(rebuilt.as_bytes())
        .await
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    if !request.body_prefix.is_empty() {
        remote
            .write_all(&request.body_prefix)
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
    }

    let stats = relay::run(client, remote, relay::IDLE_TIMEOUT).await;
    accountant.record_upstream(stats.bytes_up);
    accountant.record_downstream(stats.bytes_down);
    info!(user = %username, host = %host, port, method = %request.method, bytes_up = stats.bytes_up, bytes_down = stats.bytes_down, "http forward session ended");
    let _ = request.version;
    Ok(())
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
    async fn auth_failure_sends_407_and_closes() {
        let (mut test_client, mut proxy_side) = tcp_pair().await;
        let cfg = Config::parse("SOCKS_PASSWORD=pw\n");
        let headers = vec!["Host: example.com".to_string()];

        let result = authenticate(&mut proxy_side, &cfg, &headers).await.unwrap();
        assert!(result.is_none());

        let mut buf = vec![0u8; 256];
        let n = test_client.read(&mut buf).await.unwrap();
        let resp = String::from_utf8_lossy(&buf[..n]);
        assert!(resp.starts_with("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(resp.contains("Proxy-Authenticate: Basic"));
    }

    #[tokio::test]
    async fn connect_tunnels_and_relays_both_directions() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            sock.write_all(b"pong").await.unwrap();
        });

        let (mut test_client, proxy_side) = tcp_pair().await;
        let cfg = Config::default();
        let pool = IpPool::default();
        let accountant = Accountant::new();

        let request = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        let handle_task = tokio::spawn(async move { handle(proxy_side, &cfg, &pool, &accountant).await });
        test_client.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 128];
        let n = test_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        test_client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        test_client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(test_client);
        let result = handle_task.await.unwrap();
        assert!(result.is_ok());
        origin_task.await.unwrap();
    }

    #[tokio::test]
    async fn forward_rewrites_request_line_and_strips_proxy_headers() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let origin_task = tokio::spawn(async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let n = sock.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
            assert!(!text.to_ascii_lowercase().contains("proxy-"));
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        });

        let (mut test_client, proxy_side) = tcp_pair().await;
        let cfg = Config::parse("SOCKS_PASSWORD=pw\n");
        let pool = IpPool::default();
        let accountant = Accountant::new();

        let request = format!(
            "GET http://{origin_addr}/a?b=1 HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Authorization: Basic dXNlcjE6cHc=\r\nProxy-Connection: keep-alive\r\nUser-Agent: x\r\n\r\n"
        );
        let handle_task = tokio::spawn(async move { handle(proxy_side, &cfg, &pool, &accountant).await });
        test_client.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = test_client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));

        drop(test_client);
        let result = handle_task.await.unwrap();
        assert!(result.is_ok());
        origin_task.await.unwrap();
    }

    #[test]
    fn decodes_basic_credentials() {
        // base64("user3:pw") == "dXNlcjM6cHc="
        let (user, pass) = decode_basic("Basic dXNlcjM6cHc=").unwrap();
        assert_eq!(user, "user3");
        assert_eq!(pass, "pw");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(decode_basic("Digest abcdef").is_none());
    }

    #[test]
    fn parses_absolute_uri_with_query() {
        let (host, port, path) = parse_absolute_uri("http://example.com/a?b=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/a?b=1");
    }

    #[test]
    fn parses_absolute_uri_with_explicit_port() {
        let (host, port, path) = parse_absolute_uri("http://example.com:8080/x").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/x");
    }

    #[test]
    fn rejects_https_scheme_target() {
        assert!(parse_absolute_uri("https://example.com/").is_err());
    }

    #[test]
    fn rebuild_strips_proxy_headers() {
        let headers = vec![
            "Host: example.com".to_string(),
            "Proxy-Authorization: Basic dXNlcjE6cHc=".to_string(),
            "Proxy-Connection: keep-alive".to_string(),
            "User-Agent: x".to_string(),
        ];
        let rebuilt = rebuild_request("GET", "/a?b=1", &headers);
        assert_eq!(rebuilt, "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: x\r\n\r\n");
    }

    #[test]
    fn rebuild_is_idempotent_once_proxy_headers_are_gone() {
        let headers = vec!["Host: example.com".to_string(), "User-Agent: x".to_string()];
        let once = rebuild_request("GET", "/a?b=1", &headers);
        // Re-parse as if it were the new request and rebuild again.
        let mut lines = once.split("\r\n");
        let _request_line = lines.next();
        let headers_again: Vec<String> = lines.filter(|l| !l.is_empty()).map(str::to_string).collect();
        let twice = rebuild_request("GET", "/a?b=1", &headers_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn split_host_port_defaults_when_absent() {
        assert_eq!(split_host_port("example.com", 443), ("example.com".to_string(), 443));
        assert_eq!(split_host_port("example.com:8443", 443), ("example.com".to_string(), 8443));
    }
}
