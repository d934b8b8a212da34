//! Server configuration: command line, environment, and an optional TOML file.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Parser)]
#[command(name = "ircbridge-server", about = "IRC-style gateway into a backend client pool")]
pub struct ServerConfig {
    /// Address to accept client connections on.
    #[arg(long, env = "IRCBRIDGE_LISTEN", default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// Name announced in the WELCOME reply.
    #[arg(long, env = "IRCBRIDGE_SERVER_NAME", default_value = "ircbridge")]
    pub server_name: String,

    /// Seconds a new connection has to send CONNECT.
    #[arg(long, env = "IRCBRIDGE_REGISTRATION_TIMEOUT", default_value_t = 5)]
    pub registration_timeout_secs: u64,

    /// Keepalive window in seconds. A client that misses two windows is dropped.
    #[arg(long, env = "IRCBRIDGE_KEEPALIVE_INTERVAL", default_value_t = 30)]
    pub keepalive_interval_secs: u64,

    /// Longest accepted input line, in bytes.
    #[arg(long, env = "IRCBRIDGE_MAX_LINE_LEN", default_value_t = 8192)]
    pub max_line_len: usize,

    /// Peer address allowed to connect (repeatable). `*` allows everyone.
    #[arg(long = "allow", value_name = "IP")]
    pub allow: Vec<String>,

    /// TOML file with extra settings (currently the `allow` list).
    #[arg(long, env = "IRCBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6667".to_string(),
            server_name: "ircbridge".to_string(),
            registration_timeout_secs: 5,
            keepalive_interval_secs: 30,
            max_line_len: 8192,
            allow: Vec::new(),
            config: None,
        }
    }
}

impl ServerConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Build the access list from `--allow` plus the config file, if any.
    pub fn access_list(&self) -> Result<AccessList, ConfigError> {
        let mut entries = self.allow.clone();
        if let Some(ref path) = self.config {
            entries.extend(FileConfig::load(path)?.allow);
        }
        AccessList::parse(&entries)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    allow: Vec<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Peers allowed to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessList {
    any: bool,
    addrs: Vec<IpAddr>,
}

impl AccessList {
    /// Loopback only.
    pub fn loopback() -> Self {
        Self {
            any: false,
            addrs: vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
        }
    }

    /// Parse textual entries. An empty list means loopback only.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Ok(Self::loopback());
        }
        let mut list = Self { any: false, addrs: Vec::new() };
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry == "*" {
                list.any = true;
                continue;
            }
            let ip: IpAddr = entry
                .parse()
                .map_err(|_| ConfigError::InvalidEntry(entry.to_string()))?;
            if !list.addrs.contains(&ip) {
                list.addrs.push(ip);
            }
        }
        Ok(list)
    }

    /// Whether `peer` may proceed. Peers without an address only pass a `*` list.
    pub fn permits(&self, peer: Option<IpAddr>) -> bool {
        if self.any {
            return true;
        }
        match peer {
            Some(ip) => self.addrs.contains(&ip.to_canonical()),
            None => false,
        }
    }
}
