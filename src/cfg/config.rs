// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{env, fs, path::Path, path::PathBuf};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::session::entry::L4Kind;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Number of packet worker threads. Session affinity is
    /// `hash(id) % packetThreads` for the lifetime of the flow.
    #[serde(rename = "packetThreads", default = "default_packet_threads")]
    pub packet_threads: u16,

    /// Per-L4 capacity. The head of an active queue is evicted once the
    /// queue grows past this limit.
    #[serde(rename = "maxStreams", default)]
    pub max_streams: StreamLimits,

    /// Per-L4 idle expiry in seconds.
    #[serde(default)]
    pub timeouts: IdleTimeouts,

    /// Seconds a TCP session lingers on the closing queue before its final
    /// save.
    #[serde(rename = "tcpClosingTimeout", default = "default_tcp_closing")]
    pub tcp_closing_timeout: u8,

    /// Checkpoint interval in seconds for long-lived TCP flows.
    #[serde(rename = "tcpSaveTimeout", default = "default_tcp_save")]
    pub tcp_save_timeout: u32,

    /// Whether sessions carry the per-packet length array.
    #[serde(rename = "enablePacketLen", default)]
    pub enable_packet_len: bool,

    /// Node name, used as a component of the stopped-sessions file path.
    #[serde(rename = "nodeName", default = "default_node_name")]
    pub node_name: String,

    /// Verbose diagnostics.
    #[serde(default)]
    pub debug: bool,
}

fn default_packet_threads() -> u16 {
    1
}

fn default_tcp_closing() -> u8 {
    5
}

fn default_tcp_save() -> u32 {
    400
}

fn default_node_name() -> String {
    "flowcap".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_threads: default_packet_threads(),
            max_streams: StreamLimits::default(),
            timeouts: IdleTimeouts::default(),
            tcp_closing_timeout: default_tcp_closing(),
            tcp_save_timeout: default_tcp_save(),
            enable_packet_len: false,
            node_name: default_node_name(),
            debug: false,
        }
    }
}

/// Per-L4 stream capacity.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct StreamLimits {
    pub icmp: u32,
    pub udp: u32,
    pub tcp: u32,
    pub sctp: u32,
    pub esp: u32,
    pub other: u32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            icmp: 1_500_000,
            udp: 1_500_000,
            tcp: 1_500_000,
            sctp: 1_500_000,
            esp: 1_500_000,
            other: 1_500_000,
        }
    }
}

impl StreamLimits {
    pub fn get(&self, kind: L4Kind) -> u32 {
        match kind {
            L4Kind::Icmp => self.icmp,
            L4Kind::Udp => self.udp,
            L4Kind::Tcp => self.tcp,
            L4Kind::Sctp => self.sctp,
            L4Kind::Esp => self.esp,
            L4Kind::Other => self.other,
        }
    }
}

/// Per-L4 idle expiry, seconds.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct IdleTimeouts {
    pub icmp: u32,
    pub udp: u32,
    pub tcp: u32,
    pub sctp: u32,
    pub esp: u32,
    pub other: u32,
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            icmp: 10,
            udp: 60,
            tcp: 480,
            sctp: 60,
            esp: 600,
            other: 60,
        }
    }
}

impl IdleTimeouts {
    pub fn get(&self, kind: L4Kind) -> u32 {
        match kind {
            L4Kind::Icmp => self.icmp,
            L4Kind::Udp => self.udp,
            L4Kind::Tcp => self.tcp,
            L4Kind::Sctp => self.sctp,
            L4Kind::Esp => self.esp,
            L4Kind::Other => self.other,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Resolves a possibly-relative config path against the current working
    /// directory, then loads it.
    pub fn resolve_and_load(rel: &str) -> Result<Self> {
        let p = Path::new(rel);
        let abs = if p.is_absolute() {
            p.to_path_buf()
        } else {
            env::current_dir()
                .context("cannot get current working dir")?
                .join(p)
        };
        Self::load_from_file(abs)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.packet_threads >= 1, "packetThreads must be >= 1");
        ensure!(
            self.tcp_closing_timeout >= 1,
            "tcpClosingTimeout must be in 1..=255"
        );
        ensure!(self.tcp_save_timeout >= 1, "tcpSaveTimeout must be >= 1");
        ensure!(!self.node_name.is_empty(), "nodeName must not be empty");
        ensure!(
            !self.node_name.contains(std::path::MAIN_SEPARATOR),
            "nodeName must not contain path separators"
        );
        Ok(())
    }

    /// Path of the persisted stopped-sessions side table:
    /// `{tmp}/{nodeName}.stoppedsessions`.
    pub fn stopped_sessions_path(&self) -> PathBuf {
        env::temp_dir().join(format!("{}.stoppedsessions", self.node_name))
    }
}
