// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-flow session state.
//!
//! A `SessionEntry` is created by its owning worker on the first packet of a
//! flow and mutated only by that worker. Intrusive link triples keep the
//! entry on its hash chain, its active/closing queue, and (for TCP) the
//! write queue without separate allocations.

use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, Ipv6Addr},
};

use bitflags::bitflags;

use crate::session::{
    arena::SessionHandle,
    fields::FieldMap,
    id::SessionId,
    protocols::ProtocolId,
};

pub const L4_KIND_COUNT: usize = 6;

/// Semantic L4 protocol family; selects per-kind capacity and timeout
/// policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum L4Kind {
    Icmp,
    Udp,
    Tcp,
    Sctp,
    Esp,
    Other,
}

impl L4Kind {
    pub const ALL: [L4Kind; L4_KIND_COUNT] = [
        L4Kind::Icmp,
        L4Kind::Udp,
        L4Kind::Tcp,
        L4Kind::Sctp,
        L4Kind::Esp,
        L4Kind::Other,
    ];

    pub fn index(self) -> usize {
        match self {
            L4Kind::Icmp => 0,
            L4Kind::Udp => 1,
            L4Kind::Tcp => 2,
            L4Kind::Sctp => 3,
            L4Kind::Esp => 4,
            L4Kind::Other => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            L4Kind::Icmp => "icmp",
            L4Kind::Udp => "udp",
            L4Kind::Tcp => "tcp",
            L4Kind::Sctp => "sctp",
            L4Kind::Esp => "esp",
            L4Kind::Other => "other",
        }
    }
}

pub const TCP_FLAG_COUNT: usize = 8;

/// Index into the per-session TCP flag histogram.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpFlagKind {
    Syn,
    SynAck,
    Ack,
    Psh,
    Rst,
    Fin,
    Urg,
    SrcZero,
}

impl TcpFlagKind {
    pub fn index(self) -> usize {
        match self {
            TcpFlagKind::Syn => 0,
            TcpFlagKind::SynAck => 1,
            TcpFlagKind::Ack => 2,
            TcpFlagKind::Psh => 3,
            TcpFlagKind::Rst => 4,
            TcpFlagKind::Fin => 5,
            TcpFlagKind::Urg => 6,
            TcpFlagKind::SrcZero => 7,
        }
    }
}

bitflags! {
    /// Session lifecycle bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct SessionFlags: u16 {
        /// Parked on the closing queue awaiting the closing timeout.
        const CLOSING_QUEUED   = 0x0001;
        /// Finalization completed but the save is deferred on outstanding
        /// queries.
        const NEEDS_SAVE       = 0x0002;
        /// A checkpoint save is pending for this session.
        const MID_SAVE         = 0x0004;
        /// This session inserted its id into the stopped-set `new`
        /// generation.
        const IN_STOPPED_SAVE  = 0x0008;
        /// Stop generating SPI (index) data for this flow.
        const STOP_SPI         = 0x0010;
        /// Linked on a hash chain.
        const IN_HASH          = 0x0020;
        /// Linked on the TCP write queue.
        const TCP_QUEUED       = 0x0040;
    }
}

/// Packet arrival time, seconds + microseconds since the epoch.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketTime {
    pub sec: u64,
    pub usec: u32,
}

impl PacketTime {
    pub fn new(sec: u64, usec: u32) -> Self {
        Self { sec, usec }
    }
}

/// Lineage marker for sessions that have been checkpoint-saved: later
/// records reference the first one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RootId {
    #[default]
    None,
    /// This session is its own root (set by the first checkpoint).
    Own,
    Other(String),
}

/// One reassembly fragment awaiting in-order delivery. TCP sessions only.
#[derive(Clone, Debug)]
pub struct TcpSegment {
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Per-session protocol parser slot. The save callback runs on final and
/// checkpoint saves; freeing happens through `Drop` when the session is
/// released.
pub trait ParserState: Send {
    fn on_save(&mut self, fields: &mut FieldMap, is_final: bool);
}

/// Intrusive doubly-linked list hooks, one triple per list a session can be
/// on.
#[derive(Clone, Copy, Default, Debug)]
pub struct Links {
    pub prev: Option<SessionHandle>,
    pub next: Option<SessionHandle>,
}

pub struct SessionEntry {
    pub session_id: SessionId,
    pub thread: u16,
    pub kind: L4Kind,
    pub protocol: ProtocolId,

    /// Endpoints as IPv6 (v4-mapped for IPv4 flows).
    pub addr1: Ipv6Addr,
    pub addr2: Ipv6Addr,
    pub port1: u16,
    pub port2: u16,

    /// Per-direction counters, index 0 = addr1→addr2.
    pub packets: [u32; 2],
    pub bytes: [u64; 2],
    pub data_bytes: [u64; 2],
    pub tcp_flag_counts: [u16; TCP_FLAG_COUNT],

    pub first_packet: PacketTime,
    pub last_packet: PacketTime,
    pub syn_time: u64,
    pub ack_time: u64,
    /// When the next scheduled save (closing or checkpoint) fires.
    pub save_time: u64,

    pub fields: FieldMap,

    /// Offsets into PCAP storage for this session's packets.
    pub file_positions: Vec<u64>,
    /// Per-packet lengths; present only when `enablePacketLen` is set.
    pub file_lengths: Option<Vec<u16>>,
    pub file_numbers: Vec<u32>,
    pub last_file_num: u32,

    pub parsers: Vec<Box<dyn ParserState>>,
    pub tcp_segments: VecDeque<TcpSegment>,
    pub root_id: RootId,

    pub flags: SessionFlags,
    /// Remaining packets to write to PCAP; 0xffff = unlimited, 0 = stopped.
    pub stop_saving: u16,
    pub outstanding_queries: u16,

    pub(crate) hash32: u32,
    pub(crate) hash_links: Links,
    pub(crate) queue_links: Links,
    pub(crate) tcp_links: Links,
}

impl SessionEntry {
    pub(crate) fn new(
        session_id: SessionId,
        hash32: u32,
        thread: u16,
        kind: L4Kind,
        protocol: ProtocolId,
        enable_packet_len: bool,
    ) -> Self {
        Self {
            session_id,
            thread,
            kind,
            protocol,
            addr1: Ipv6Addr::UNSPECIFIED,
            addr2: Ipv6Addr::UNSPECIFIED,
            port1: 0,
            port2: 0,
            packets: [0; 2],
            bytes: [0; 2],
            data_bytes: [0; 2],
            tcp_flag_counts: [0; TCP_FLAG_COUNT],
            first_packet: PacketTime::default(),
            last_packet: PacketTime::default(),
            syn_time: 0,
            ack_time: 0,
            save_time: 0,
            fields: FieldMap::default(),
            file_positions: Vec::with_capacity(100),
            file_lengths: enable_packet_len.then(|| Vec::with_capacity(100)),
            file_numbers: Vec::new(),
            last_file_num: 0,
            parsers: Vec::new(),
            tcp_segments: VecDeque::new(),
            root_id: RootId::None,
            flags: SessionFlags::empty(),
            stop_saving: 0xffff,
            outstanding_queries: 0,
            hash32,
            hash_links: Links::default(),
            queue_links: Links::default(),
            tcp_links: Links::default(),
        }
    }

    pub fn set_endpoints(
        &mut self,
        addr1: IpAddr,
        port1: u16,
        addr2: IpAddr,
        port2: u16,
    ) {
        self.addr1 = to_mapped(addr1);
        self.addr2 = to_mapped(addr2);
        self.port1 = port1;
        self.port2 = port2;
    }

    pub fn hash32(&self) -> u32 {
        self.hash32
    }

    pub fn add_tag(&mut self, tag: &str) {
        self.fields.add_tag(tag);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.fields.has_tag(tag)
    }

    pub fn add_protocol(&mut self, protocol: &str) {
        self.fields.add_protocol(protocol);
    }

    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.fields.has_protocol(protocol)
    }

    pub fn note_tcp_flag(&mut self, flag: TcpFlagKind) {
        let slot = &mut self.tcp_flag_counts[flag.index()];
        *slot = slot.saturating_add(1);
    }
}

fn to_mapped(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

impl fmt::Display for SessionEntry {
    /// `a.b.c.d:p => a.b.c.d:p` for v4-mapped flows, `addr.p => addr.p`
    /// otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr1.to_ipv4_mapped(), self.addr2.to_ipv4_mapped()) {
            (Some(ip1), Some(ip2)) => {
                write!(f, "{ip1}:{} => {ip2}:{}", self.port1, self.port2)
            },
            _ => write!(
                f,
                "{}.{} => {}.{}",
                self.addr1, self.port1, self.addr2, self.port2
            ),
        }
    }
}
