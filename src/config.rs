use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// A case-sensitive key=value snapshot parsed from the control plane's
/// config file. Immutable once built; the listener re-parses the file on
/// every accept rather than mutating a shared instance (§9 "per-connection
/// config reload").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn socks_username(&self) -> &str {
        self.get("SOCKS_USERNAME").unwrap_or("user")
    }

    pub fn socks_password(&self) -> &str {
        self.get("SOCKS_PASSWORD").unwrap_or("")
    }

    pub fn local_socks_port(&self) -> u16 {
        self.get("LOCAL_SOCKS_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1080)
    }

    pub fn local_http_port(&self) -> u16 {
        self.get("LOCAL_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8118)
    }

    pub fn ipv6_only(&self) -> bool {
        self.get("IPV6_ONLY").map(|v| v == "true").unwrap_or(false)
    }

    /// Parse `KEY=VALUE` lines. `#`-prefixed and blank lines are ignored;
    /// surrounding double quotes on the value are stripped; lines without
    /// an `=` are ignored rather than rejected, matching the original's
    /// tolerant `load_cfg`.
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), value.to_string());
        }
        Config { values }
    }

    /// Load from disk, tolerating a missing file as an empty config.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "config file unreadable, using defaults");
                Config::default()
            }
        }
    }
}

/// An ordered, 0-indexed pool of textual IPv6 addresses. Duplicates are
/// preserved intentionally: the pool is a plain list the control plane
/// authors, and de-duplicating it here would silently change index-based
/// sticky bindings out from under the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpPool {
    addrs: Vec<String>,
}

impl IpPool {
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.addrs.get(index).map(String::as_str)
    }

    pub fn parse(text: &str) -> Self {
        let addrs = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        IpPool { addrs }
    }

    /// Load from disk, tolerating a missing file as an empty pool.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ip pool file unreadable, using empty pool");
                IpPool::default()
            }
        }
    }
}
