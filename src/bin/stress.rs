use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Clone, Copy, Debug)]
enum Mode {
    Http,
    Connect,
    Idle,
}

struct Opts {
    target: String,
    mode: Mode,
    payload: String,
    conns: usize,
    duration_secs: u64,
    user: String,
    password: String,
}

fn parse_args() -> Opts {
    let mut target = String::from("127.0.0.1:8118");
    let mut mode = Mode::Http;
    let mut payload = String::from("http://example.com/");
    let mut conns: usize = 500;
    let mut duration_secs: u64 = 60;
    let mut user = String::from("user1");
    let mut password = String::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--target" {
            if let Some(v) = args.next() {
                target = v;
            }
        } else if let Some(v) = arg.strip_prefix("--target=") {
            target = v.to_string();
        } else if arg == "--mode" {
            if let Some(v) = args.next() {
                mode = parse_mode(&v);
            }
        } else if let Some(v) = arg.strip_prefix("--mode=") {
            mode = parse_mode(v);
        } else if arg == "--payload" {
            if let Some(v) = args.next() {
                payload = v;
            }
        } else if let Some(v) = arg.strip_prefix("--payload=") {
            payload = v.to_string();
        } else if arg == "--conns" {
            if let Some(v) = args.next() {
                conns = v.parse().unwrap_or(conns);
            }
        } else if let Some(v) = arg.strip_prefix("--conns=") {
            conns = v.parse().unwrap_or(conns);
        } else if arg == "--duration-secs" {
            if let Some(v) = args.next() {
                duration_secs = v.parse().unwrap_or(duration_secs);
            }
        } else if let Some(v) = arg.strip_prefix("--duration-secs=") {
            duration_secs = v.parse().unwrap_or(duration_secs);
        } else if arg == "--user" {
            if let Some(v) = args.next() {
                user = v;
            }
        } else if let Some(v) = arg.strip_prefix("--user=") {
            user = v.to_string();
        } else if arg == "--password" {
            if let Some(v) = args.next() {
                password = v;
            }
        } else if let Some(v) = arg.strip_prefix("--password=") {
            password = v.to_string();
        } else if arg == "-h" || arg == "--help" {
            print_help_and_exit();
        }
    }
    Opts {
        target,
        mode,
        payload,
        conns,
        duration_secs,
        user,
        password,
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "http" => Mode::Http,
        "connect" => Mode::Connect,
        "idle" => Mode::Idle,
        _ => Mode::Http,
    }
}

fn print_help_and_exit() -> ! {
    eprintln!(
        "stress - load-test tool for the sticky-egress HTTP proxy\n\n\
Options:\n\
  --target ADDR:PORT       Proxy address (default 127.0.0.1:8118)\n\
  --mode http|connect|idle Mode: http absolute-URI GET; connect sends CONNECT then closes; idle opens TCP and does nothing\n\
  --payload STR            http: URI (default http://example.com/); connect: host:port (default example.com:443)\n\
  --user NAME              Sticky username sent as Proxy-Authorization (default user1)\n\
  --password PASS          Password sent alongside --user (default empty)\n\
  --conns N                Concurrent connections (default 500)\n\
  --duration-secs S        Test duration in seconds (default 60)\n"
    );
    std::process::exit(0)
}

fn proxy_auth_header(user: &str, password: &str) -> String {
    let creds = format!("{user}:{password}");
    format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(creds))
}

async fn worker_http(target: &str, uri: &str, auth_header: &str) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(target).await?;
    let host = uri.strip_prefix("http://").and_then(|r| r.split('/').next()).unwrap_or("");
    let req = format!(
        "GET {uri} HTTP/1.1\r\nHost: {host}\r\n{auth_header}Connection: close\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).await?;
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;
    Ok(())
}

async fn worker_connect(target: &str, authority: &str, auth_header: &str) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(target).await?;
    let req = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n{auth_header}Connection: close\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).await?;
    let mut buf = [0u8; 128];
    let _ = stream.read(&mut buf).await;
    Ok(())
}

async fn worker_idle(target: &str) -> anyhow::Result<()> {
    let _stream = TcpStream::connect(target).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = parse_args();
    let payload = if matches!(opts.mode, Mode::Connect) {
        if opts.payload.is_empty() || !opts.payload.contains(':') {
            "example.com:443".to_string()
        } else {
            opts.payload
        }
    } else {
        opts.payload
    };
    let auth_header = proxy_auth_header(&opts.user, &opts.password);

    let stop = Arc::new(AtomicBool::new(false));
    let success = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let stop_clone = stop.clone();
    let duration_secs = opts.duration_secs;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(duration_secs)).await;
        stop_clone.store(true, Ordering::SeqCst);
    });

    let s_succ = success.clone();
    let s_fail = failures.clone();
    tokio::spawn(async move {
        let mut prev_s = 0u64;
        let mut prev_f = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let s = s_succ.load(Ordering::Relaxed);
            let f = s_fail.load(Ordering::Relaxed);
            let ds = s - prev_s;
            let df = f - prev_f;
            prev_s = s;
            prev_f = f;
            eprintln!("[{:?}] +ok={ds} +err={df} total_ok={s} total_err={f}", start.elapsed());
        }
    });

    let mut tasks = Vec::with_capacity(opts.conns);
    for _ in 0..opts.conns {
        let target_c = opts.target.clone();
        let payload_c = payload.clone();
        let auth_c = auth_header.clone();
        let stop_c = stop.clone();
        let succ_c = success.clone();
        let fail_c = failures.clone();
        let mode = opts.mode;
        tasks.push(tokio::spawn(async move {
            while !stop_c.load(Ordering::Relaxed) {
                let res = match mode {
                    Mode::Http => worker_http(&target_c, &payload_c, &auth_c).await,
                    Mode::Connect => worker_connect(&target_c, &payload_c, &auth_c).await,
                    Mode::Idle => worker_idle(&target_c).await,
                };
                match res {
                    Ok(_) => {
                        succ_c.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        fail_c.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for t in tasks {
        let _ = t.await;
    }
    eprintln!(
        "Finished in {:?}. ok={} err={}",
        start.elapsed(),
        success.load(Ordering::Relaxed),
        failures.load(Ordering::Relaxed)
    );
    Ok(())
}
