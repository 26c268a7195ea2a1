// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal ASN.1 DER reading.
//!
//! Certificates are adversarial input: every read here is bounds-checked
//! and failure is an `Option`, never a panic. Callers check and bail out of
//! the current certificate; nothing partial is kept.

use std::fmt::Write;

pub const TAG_UTF8_STRING: u32 = 12;
pub const TAG_PRINTABLE_STRING: u32 = 19;
pub const TAG_TELETEX_STRING: u32 = 20;
pub const TAG_UTC_TIME: u32 = 23;
pub const TAG_GENERALIZED_TIME: u32 = 24;

#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    /// Constructed (bit 6): the value is itself a TLV sequence.
    pub constructed: bool,
    pub tag: u32,
    pub value: &'a [u8],
}

pub struct AsnReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AsnReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    /// Reads one TLV. Indefinite lengths and lengths running past the buffer
    /// yield `None`.
    pub fn get_tlv(&mut self) -> Option<Tlv<'a>> {
        if self.remaining() < 2 {
            return None;
        }
        let first = self.next_byte()?;
        let constructed = first & 0x20 != 0;
        let mut tag = u32::from(first & 0x1f);
        if tag == 0x1f {
            // high tag number form, base-128
            tag = 0;
            loop {
                let b = self.next_byte()?;
                tag = (tag << 7) | u32::from(b & 0x7f);
                if b & 0x80 == 0 {
                    break;
                }
                if tag > 0x00ff_ffff {
                    return None;
                }
            }
        }

        let len_byte = self.next_byte()?;
        let len = if len_byte & 0x80 == 0 {
            len_byte as usize
        } else {
            let n = (len_byte & 0x7f) as usize;
            if n == 0 || n > 4 {
                return None;
            }
            let mut len = 0usize;
            for _ in 0..n {
                len = (len << 8) | self.next_byte()? as usize;
            }
            len
        };
        if len > self.remaining() {
            return None;
        }
        let value = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(Tlv {
            constructed,
            tag,
            value,
        })
    }
}

/// Decodes OBJECT IDENTIFIER contents to the dotted form. Malformed input
/// yields whatever prefix decoded cleanly.
pub fn decode_oid(value: &[u8]) -> String {
    let mut out = String::new();
    let mut acc: u64 = 0;
    let mut first = true;
    for &b in value {
        if acc > u64::MAX >> 7 {
            break;
        }
        acc = (acc << 7) | u64::from(b & 0x7f);
        if b & 0x80 != 0 {
            continue;
        }
        if first {
            let (x, y) = if acc < 40 {
                (0, acc)
            } else if acc < 80 {
                (1, acc - 40)
            } else {
                (2, acc - 80)
            };
            write!(out, "{x}.{y}").expect("Writing to String cannot fail");
            first = false;
        } else {
            write!(out, ".{acc}").expect("Writing to String cannot fail");
        }
        acc = 0;
    }
    out
}

/// Decodes UTCTime / GeneralizedTime to epoch seconds. The two-digit
/// UTCTime year pivots at 50 per RFC 5280. Anything unparseable is `None`.
pub fn parse_time(tag: u32, value: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(value).ok()?;
    if !s.is_ascii() {
        return None;
    }
    let (body, offset_secs) = split_zone(s)?;

    let (year, rest) = match tag {
        TAG_UTC_TIME => {
            let yy: i32 = field(body, 0)?;
            let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
            (year, &body[2..])
        },
        TAG_GENERALIZED_TIME => {
            if body.len() < 4 {
                return None;
            }
            let year: i32 = body[..4].parse().ok()?;
            (year, &body[4..])
        },
        _ => return None,
    };

    // drop fractional seconds
    let rest = rest.split('.').next().unwrap_or(rest);
    if rest.len() < 6 || rest.len() % 2 != 0 {
        return None;
    }
    let month = field(rest, 0)?;
    let day = field(rest, 2)?;
    let hour = field(rest, 4)?;
    let minute = if rest.len() >= 8 { field(rest, 6)? } else { 0 };
    let second = if rest.len() >= 10 { field(rest, 8)? } else { 0 };

    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
    let time = date.and_hms_opt(hour, minute, second)?;
    Some(time.and_utc().timestamp() - i64::from(offset_secs))
}

/// Splits a trailing zone designator (`Z` or `±HHMM`) off a time string and
/// returns the offset in seconds east of UTC.
fn split_zone(s: &str) -> Option<(&str, i32)> {
    if let Some(body) = s.strip_suffix('Z') {
        return Some((body, 0));
    }
    if s.len() > 5 {
        let split = s.len() - 5;
        let zone = &s[split..];
        let sign = match zone.as_bytes()[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return Some((s, 0)),
        };
        let hours: i32 = zone[1..3].parse().ok()?;
        let minutes: i32 = zone[3..5].parse().ok()?;
        return Some((&s[..split], sign * (hours * 3600 + minutes * 60)));
    }
    Some((s, 0))
}

fn field<T: std::str::FromStr>(s: &str, at: usize) -> Option<T> {
    s.get(at..at + 2)?.parse().ok()
}
