// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sink seam towards the indexing store.
//!
//! The engine never talks to a database directly: finalization and
//! checkpoint saves hand the session to a `SessionSink`, which serializes it
//! off-thread. A sink that dispatches asynchronous work re-enters the owner
//! thread through its command queue and calls
//! `Worker::decrement_outstanding` on completion.

use bytes::BytesMut;

use crate::session::entry::SessionEntry;

pub trait SessionSink: Send + Sync {
    /// Serializes the session. `is_final` distinguishes the terminal save
    /// from a checkpoint save that retains the session.
    fn save(&self, session: &mut SessionEntry, is_final: bool);
}

/// Discards everything. Useful for tooling that only wants the tables.
pub struct NoopSink;

impl SessionSink for NoopSink {
    fn save(&self, _session: &mut SessionEntry, _is_final: bool) {}
}

/// Writes `bytes` as a quoted JSON string. UTF-8 content passes through
/// with only the JSON specials escaped; in non-UTF-8 content every byte
/// above 0x7f is `\u00XX`-escaped as well, so raw attribute values survive
/// the trip.
pub fn json_string(buf: &mut BytesMut, bytes: &[u8], utf8: bool) {
    buf.extend_from_slice(b"\"");
    for &b in bytes {
        match b {
            b'"' => buf.extend_from_slice(b"\\\""),
            b'\\' => buf.extend_from_slice(b"\\\\"),
            0x08 => buf.extend_from_slice(b"\\b"),
            0x0c => buf.extend_from_slice(b"\\f"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b if b < 0x20 || (b >= 0x80 && !utf8) => {
                buf.extend_from_slice(format!("\\u{b:04x}").as_bytes());
            },
            b => buf.extend_from_slice(&[b]),
        }
    }
    buf.extend_from_slice(b"\"");
}
