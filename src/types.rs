//! wiretap/src/types.rs
//! Core data structures, type aliases, and constants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Handle for one accepted client connection.
pub type SessionId = u64;

pub const DEFAULT_PORT: u16 = 8999;
pub const DEFAULT_WORKER_THREADS: usize = 8;
pub const DEFAULT_MAX_PREAMBLE_BYTES: usize = 64 * 1024;
pub const DEFAULT_SPLICE_DEADLINE_SECS: u64 = 24 * 60 * 60;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyOptions {
    pub bind_addr: String,
    pub port: u16,
    pub worker_threads: usize,
    pub max_preamble_bytes: usize,
    pub splice_deadline_secs: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_preamble_bytes: DEFAULT_MAX_PREAMBLE_BYTES,
            splice_deadline_secs: DEFAULT_SPLICE_DEADLINE_SECS,
        }
    }
}

impl ProxyOptions {
    /// Parse options from a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Which parsing stage rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    Uri,
    StartLine,
    Header,
    PreambleTooLarge,
}

impl fmt::Display for ParseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseKind::Uri => "uri",
            ParseKind::StartLine => "start_line",
            ParseKind::Header => "header",
            ParseKind::PreambleTooLarge => "preamble_too_large",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("parse {kind} failed, input={input:?}")]
    Parse { kind: ParseKind, input: String },

    #[error("resolve failed, host={host}")]
    Resolve { host: String },

    #[error("connect failed, endpoint={endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("splice deadline exceeded")]
    Timeout,

    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Canonical record of one proxied connection, owned by the relay worker.
/// `online` flips to false exactly once, when the session disconnects.
#[derive(Serialize, Debug, Clone)]
pub struct ConnRecord {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub host: String,
    pub online: bool,
}

/// One forwarded chunk. `outside` means client-to-origin.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub id: SessionId,
    pub outside: bool,
    pub at: Instant,
    pub len: usize,
}

// Snapshot structs for JSON serialization
#[derive(Serialize, Debug, Clone)]
pub struct RelaySnapshot {
    pub connections: HashMap<SessionId, ConnRecord>,
    pub packets: Vec<PacketSnapshot>,
}

#[derive(Serialize, Debug, Clone)]
pub struct PacketSnapshot {
    pub id: SessionId,
    pub outside: bool,
    pub len: usize,
}
