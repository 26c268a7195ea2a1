// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Canonical session ids.
//!
//! A session id is a length-prefixed byte string identifying one
//! bidirectional flow:
//!
//! ```text
//! v4: | 0x0d | addr A (4) | port A (2) | addr B (4) | port B (2) |
//! v6: | 0x25 | addr A (16) | port A (2) | addr B (16) | port B (2) |
//! ```
//!
//! Endpoints are ordered so the numerically smaller address comes first
//! (ports break ties), which makes both directions of a flow produce the
//! same id. Ports are stored in network byte order.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use once_cell::sync::OnceCell;
use rand::RngExt;

pub const SESSION_ID_V4_LEN: usize = 13;
pub const SESSION_ID_V6_LEN: usize = 37;
pub const SESSION_ID_MAX_LEN: usize = SESSION_ID_V6_LEN;

/// Process-global salt XORed into every id hash so bucket placement is not
/// predictable across runs.
static HASH_SALT: OnceCell<u32> = OnceCell::new();

/// Pins the hash salt. Returns false if the salt was already fixed.
/// Intended for tests and replay tooling that need stable placement.
pub fn init_hash_salt(salt: u32) -> bool {
    HASH_SALT.set(salt).is_ok()
}

fn hash_salt() -> u32 {
    *HASH_SALT.get_or_init(|| rand::rng().random())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    buf: [u8; SESSION_ID_MAX_LEN],
}

impl SessionId {
    /// Canonical id for an IPv4 flow.
    pub fn v4(addr1: Ipv4Addr, port1: u16, addr2: Ipv4Addr, port2: u16) -> Self {
        let a = (addr1.octets(), port1);
        let b = (addr2.octets(), port2);
        let ((fst_addr, fst_port), (snd_addr, snd_port)) =
            if a <= b { (a, b) } else { (b, a) };

        let mut buf = [0u8; SESSION_ID_MAX_LEN];
        buf[0] = SESSION_ID_V4_LEN as u8;
        buf[1..5].copy_from_slice(&fst_addr);
        buf[5..7].copy_from_slice(&fst_port.to_be_bytes());
        buf[7..11].copy_from_slice(&snd_addr);
        buf[11..13].copy_from_slice(&snd_port.to_be_bytes());
        Self { buf }
    }

    /// Canonical id for an IPv6 flow.
    pub fn v6(addr1: Ipv6Addr, port1: u16, addr2: Ipv6Addr, port2: u16) -> Self {
        let a = (addr1.octets(), port1);
        let b = (addr2.octets(), port2);
        let ((fst_addr, fst_port), (snd_addr, snd_port)) =
            if a <= b { (a, b) } else { (b, a) };

        let mut buf = [0u8; SESSION_ID_MAX_LEN];
        buf[0] = SESSION_ID_V6_LEN as u8;
        buf[1..17].copy_from_slice(&fst_addr);
        buf[17..19].copy_from_slice(&fst_port.to_be_bytes());
        buf[19..35].copy_from_slice(&snd_addr);
        buf[35..37].copy_from_slice(&snd_port.to_be_bytes());
        Self { buf }
    }

    /// Reconstructs an id from its wire encoding (length byte included).
    /// Returns None on a bad length byte or short slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let len = *bytes.first()? as usize;
        if len != SESSION_ID_V4_LEN && len != SESSION_ID_V6_LEN {
            return None;
        }
        if bytes.len() < len {
            return None;
        }
        let mut buf = [0u8; SESSION_ID_MAX_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Some(Self { buf })
    }

    /// Logical length in bytes, including the length byte itself.
    pub fn byte_len(&self) -> usize {
        self.buf[0] as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.byte_len()]
    }

    pub fn is_v6(&self) -> bool {
        self.buf[0] as usize == SESSION_ID_V6_LEN
    }

    /// MurmurHash1-style mix over the id as little-endian u32 chunks, seeded
    /// by the final id byte and finalized against the process salt. Both
    /// directions of a flow hash identically because the id is already
    /// canonical.
    pub fn hash32(&self) -> u32 {
        let len = self.byte_len();
        let mut h = u32::from(self.buf[len - 1]);
        let mut off = 0;
        while off + 4 < len {
            let chunk = u32::from_le_bytes([
                self.buf[off],
                self.buf[off + 1],
                self.buf[off + 2],
                self.buf[off + 3],
            ]);
            h = h.wrapping_add(chunk).wrapping_mul(0xc6a4_a793);
            h ^= h >> 16;
            off += 4;
        }
        h ^ hash_salt()
    }

    /// Stable owning-thread index for this flow.
    pub fn thread_for(&self, packet_threads: u16) -> u16 {
        (self.hash32() % u32::from(packet_threads.max(1))) as u16
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.to_hex())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
