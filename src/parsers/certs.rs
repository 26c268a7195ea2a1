// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS server-certificate parsing.
//!
//! Input is the TLS Handshake certificate-chain payload: a 3-byte total
//! length followed by `(3-byte length, DER)` records. Each certificate is
//! hashed, decoded for identity fields only (no chain or signature
//! verification), deduplicated structurally against the session's
//! certificate set, and projected to JSON at save time.
//!
//! A malformed certificate aborts the rest of the chain; nothing partial is
//! kept.

use std::any::Any;

use bytes::BytesMut;
use once_cell::sync::OnceCell;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::{
    db::json_string,
    parsers::{
        self, NamedFuncId,
        asn1::{
            AsnReader, TAG_PRINTABLE_STRING, TAG_TELETEX_STRING, TAG_UTF8_STRING,
            decode_oid, parse_time,
        },
        oid::{
            self, OID_COMMON_NAME, OID_EC_PUBLIC_KEY, OID_KEY_USAGE, OID_ORG_NAME,
            OID_ORG_UNIT, OID_SUBJECT_ALT_NAME,
        },
    },
    session::{
        entry::SessionEntry,
        fields::{self, FieldId, FieldKind, FieldMap, FieldValue, TaggedString},
    },
    utils::{ascii_lowercase, digest_colon_hex},
};

const SECONDS_PER_DAY: i64 = 60 * 60 * 24;

/// One ordered name sequence per attribute the engine extracts.
#[derive(Default, Debug, Clone)]
pub struct CertNames {
    pub common_name: Vec<TaggedString>,
    pub org_name: Vec<TaggedString>,
    pub org_unit: Vec<TaggedString>,
}

#[derive(Default, Debug, Clone)]
pub struct CertInfo {
    pub not_before: i64,
    pub not_after: i64,
    pub issuer: CertNames,
    pub subject: CertNames,
    /// DNS subjectAltName entries, valid UTF-8 only, ASCII-lowercased.
    pub alt: Vec<TaggedString>,
    /// Raw serial-number integer bytes.
    pub serial: Vec<u8>,
    /// SHA-1 of the DER bytes as colon-separated hex, 59 chars.
    pub hash: String,
    pub is_ca: bool,
    pub public_algorithm: Option<&'static str>,
    pub curve: Option<&'static str>,
    /// Plugin annotations, insertion-ordered.
    pub extra: Option<Vec<(String, String)>>,
}

impl CertInfo {
    /// Cheap structural pre-key: serial endpoints plus the name-sequence
    /// counts, six bits each. An empty serial contributes nothing, so two
    /// serial-less certificates fall back to the count bits alone.
    pub fn dedup_hash(&self) -> u32 {
        let count = |n: usize| (n as u32) & 0x3f;
        let mut h = (count(self.issuer.common_name.len()) << 18)
            | (count(self.issuer.org_name.len()) << 12)
            | (count(self.subject.common_name.len()) << 6)
            | count(self.subject.org_name.len());
        if let (Some(first), Some(last)) = (self.serial.first(), self.serial.last()) {
            h |= (u32::from(*first) << 28) | (u32::from(*last) << 24);
        }
        h
    }

    /// Structural identity: serial bytes and all six name sequences
    /// pairwise. Alt names deliberately do not participate.
    pub fn structurally_equal(&self, other: &CertInfo) -> bool {
        self.serial == other.serial
            && names_equal(&self.issuer, &other.issuer)
            && names_equal(&self.subject, &other.subject)
    }

    /// Inserts or replaces a plugin annotation, keeping insertion order.
    pub fn update_extra(&mut self, key: &str, value: &str) {
        let extra = self.extra.get_or_insert_default();
        match extra.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => extra.push((key.to_string(), value.to_string())),
        }
    }

    /// JSON projection for the sink. Key order matches the index mappings
    /// downstream: hash, algorithms, name arrays, serial, alt names, then
    /// the validity numbers (milliseconds for the timestamps) and any extra
    /// annotations.
    pub fn save_json(&self, buf: &mut BytesMut, first_packet_sec: u64) {
        buf.extend_from_slice(b"{\"hash\":\"");
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(b"\",");

        if let Some(alg) = self.public_algorithm {
            buf.extend_from_slice(b"\"publicAlgorithm\":\"");
            buf.extend_from_slice(alg.as_bytes());
            buf.extend_from_slice(b"\",");
        }
        if let Some(curve) = self.curve {
            buf.extend_from_slice(b"\"curve\":\"");
            buf.extend_from_slice(curve.as_bytes());
            buf.extend_from_slice(b"\",");
        }

        save_string_seq(buf, "issuerCN", &self.issuer.common_name);
        save_string_seq(buf, "issuerON", &self.issuer.org_name);
        save_string_seq(buf, "issuerOU", &self.issuer.org_unit);
        save_string_seq(buf, "subjectCN", &self.subject.common_name);
        save_string_seq(buf, "subjectON", &self.subject.org_name);
        save_string_seq(buf, "subjectOU", &self.subject.org_unit);

        if !self.serial.is_empty() {
            buf.extend_from_slice(b"\"serial\":\"");
            buf.extend_from_slice(hex::encode(&self.serial).as_bytes());
            buf.extend_from_slice(b"\",");
        }

        if !self.alt.is_empty() {
            buf.extend_from_slice(
                format!("\"altCnt\":{},", self.alt.len()).as_bytes(),
            );
        }
        save_string_seq(buf, "alt", &self.alt);

        buf.extend_from_slice(
            format!("\"notBefore\":{},", self.not_before * 1000).as_bytes(),
        );
        buf.extend_from_slice(
            format!("\"notAfter\":{},", self.not_after * 1000).as_bytes(),
        );
        let first = first_packet_sec as i64;
        if self.not_after < first {
            buf.extend_from_slice(b"\"remainingDays\":0,");
            buf.extend_from_slice(b"\"remainingSeconds\":0,");
        } else {
            buf.extend_from_slice(
                format!(
                    "\"remainingDays\":{},",
                    (self.not_after - first) / SECONDS_PER_DAY
                )
                .as_bytes(),
            );
            buf.extend_from_slice(
                format!("\"remainingSeconds\":{},", self.not_after - first)
                    .as_bytes(),
            );
        }
        buf.extend_from_slice(
            format!(
                "\"validDays\":{},",
                (self.not_after - self.not_before) / SECONDS_PER_DAY
            )
            .as_bytes(),
        );
        buf.extend_from_slice(
            format!("\"validSeconds\":{},", self.not_after - self.not_before)
                .as_bytes(),
        );

        if let Some(extra) = &self.extra {
            for (key, value) in extra {
                json_string(buf, key.as_bytes(), true);
                buf.extend_from_slice(b":");
                json_string(buf, value.as_bytes(), true);
                buf.extend_from_slice(b",");
            }
        }

        if buf.last() == Some(&b',') {
            buf.truncate(buf.len() - 1);
        }
        buf.extend_from_slice(b"}");
    }
}

fn seq_eq(a: &[TaggedString], b: &[TaggedString]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.bytes == y.bytes)
}

fn names_equal(a: &CertNames, b: &CertNames) -> bool {
    seq_eq(&a.common_name, &b.common_name)
        && seq_eq(&a.org_name, &b.org_name)
        && seq_eq(&a.org_unit, &b.org_unit)
}

fn save_string_seq(buf: &mut BytesMut, key: &str, seq: &[TaggedString]) {
    if seq.is_empty() {
        return;
    }
    buf.extend_from_slice(format!("\"{key}\":[").as_bytes());
    for (i, s) in seq.iter().enumerate() {
        if i > 0 {
            buf.extend_from_slice(b",");
        }
        json_string(buf, &s.bytes, s.utf8);
    }
    buf.extend_from_slice(b"],");
}

/// Per-session set of unique certificates, keyed by `dedup_hash` plus
/// structural equality.
#[derive(Default, Debug)]
pub struct CertSet {
    items: Vec<(u32, CertInfo)>,
}

impl CertSet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertInfo> {
        self.items.iter().map(|(_, c)| c)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CertInfo> {
        self.items.iter_mut().map(|(_, c)| c)
    }

    pub fn contains(&self, cert: &CertInfo) -> bool {
        let h = cert.dedup_hash();
        self.items
            .iter()
            .any(|(ih, ic)| *ih == h && ic.structurally_equal(cert))
    }

    /// False when an equivalent certificate is already present; the new
    /// instance is dropped in that case.
    pub fn insert(&mut self, cert: CertInfo) -> bool {
        if self.contains(&cert) {
            return false;
        }
        let h = cert.dedup_hash();
        self.items.push((h, cert));
        true
    }
}

static CERTS_FIELD: OnceCell<FieldId> = OnceCell::new();
static CERT_ALT_FIELD: OnceCell<FieldId> = OnceCell::new();
static WINFO_FUNC: OnceCell<NamedFuncId> = OnceCell::new();
static INIT: OnceCell<()> = OnceCell::new();

/// The certificate object field.
pub fn certs_field() -> FieldId {
    *CERTS_FIELD.get_or_init(|| fields::define("cert", FieldKind::CertObjects))
}

fn cert_alt_field() -> FieldId {
    *CERT_ALT_FIELD.get_or_init(|| fields::define("cert.alt", FieldKind::StrArray))
}

fn winfo_func() -> NamedFuncId {
    *WINFO_FUNC
        .get_or_init(|| parsers::get_named_func("tls_process_certificate_wInfo"))
}

/// Registers the certificate parser and its fields. Idempotent.
pub fn init() {
    INIT.get_or_init(|| {
        certs_field();
        cert_alt_field();
        winfo_func();
        parsers::add_named_func(
            "tls_process_server_certificate",
            |session, data, _uw| process_server_certificate(session, data),
        );
    });
}

/// All alt names across the session's certificate set, in insertion order.
pub fn session_alt_names(fields: &FieldMap) -> Vec<&TaggedString> {
    match fields.certs(certs_field()) {
        Some(set) => set.iter().flat_map(|c| c.alt.iter()).collect(),
        None => Vec::new(),
    }
}

/// Parses a server-certificate chain payload into the session's certificate
/// set. Registered under `tls_process_server_certificate`.
pub fn process_server_certificate(session: &mut SessionEntry, data: &[u8]) {
    if data.len() < 3 {
        return;
    }
    let mut pos = 3usize; // total length, redundant with the record lengths

    while data.len() - pos > 3 {
        let rec = &data[pos..];
        let declared =
            (rec[0] as usize) << 16 | (rec[1] as usize) << 8 | rec[2] as usize;
        let clen = declared.min(data.len() - pos - 3);
        let der = &data[pos + 3..pos + 3 + clen];

        let cert = match parse_certificate(&mut session.fields, der) {
            Ok(cert) => cert,
            Err(badreason) => {
                debug!(badreason, clen, "bad cert");
                break;
            },
        };

        let certs_id = certs_field();
        let no_prior = session
            .fields
            .certs(certs_id)
            .map(|s| s.is_empty())
            .unwrap_or(true);

        // Pragmatic self-signed check on the first certificate only:
        // issuer/subject equality, not a cryptographic verification.
        let org_match = (cert.subject.org_name.len() == 1
            && cert.issuer.org_name.len() == 1
            && cert.subject.org_name[0].bytes == cert.issuer.org_name[0].bytes)
            || (cert.subject.org_name.is_empty() && cert.issuer.org_name.is_empty());
        let cn_match = cert.subject.common_name.len() == 1
            && cert.issuer.common_name.len() == 1
            && cert.subject.common_name[0].bytes == cert.issuer.common_name[0].bytes;
        if no_prior && !cert.is_ca && org_match && cn_match {
            session.add_tag("cert:self-signed");
        }
        if cert.is_ca {
            session.add_tag("cert:certificate-authority");
        }

        let duplicate = session
            .fields
            .certs(certs_id)
            .map(|s| s.contains(&cert))
            .unwrap_or(false);
        if !duplicate {
            parsers::call_named_func(winfo_func(), session, der, Some(&cert as &dyn Any));
            session.fields.certs_entry(certs_id).insert(cert);
        }

        pos += clen + 3;
    }
}

fn parse_certificate(fields: &mut FieldMap, der: &[u8]) -> Result<CertInfo, u8> {
    let mut cert = CertInfo {
        hash: {
            let digest: [u8; 20] = Sha1::digest(der).into();
            digest_colon_hex(&digest)
        },
        ..CertInfo::default()
    };

    /* Certificate */
    let mut reader = AsnReader::new(der);
    let certificate = reader.get_tlv().ok_or(1u8)?;

    /* tbsCertificate */
    let mut tbs_reader = AsnReader::new(certificate.value);
    let tbs = tbs_reader.get_tlv().ok_or(2u8)?;
    let mut r = AsnReader::new(tbs.value);

    /* serialNumber, or [0] version first */
    let mut serial = r.get_tlv().ok_or(3u8)?;
    if serial.constructed {
        serial = r.get_tlv().ok_or(4u8)?;
    }
    cert.serial = serial.value.to_vec();

    /* signature */
    r.get_tlv().ok_or(5u8)?;

    /* issuer */
    let issuer = r.get_tlv().ok_or(6u8)?;
    process_rdn(&mut cert.issuer, issuer.value);

    /* validity */
    let validity = r.get_tlv().ok_or(7u8)?;
    let mut v = AsnReader::new(validity.value);
    let not_before = v.get_tlv().ok_or(7u8)?;
    cert.not_before = parse_time(not_before.tag, not_before.value).unwrap_or(0);
    let not_after = v.get_tlv().ok_or(7u8)?;
    cert.not_after = parse_time(not_after.tag, not_after.value).unwrap_or(0);

    /* subject */
    let subject = r.get_tlv().ok_or(8u8)?;
    process_rdn(&mut cert.subject, subject.value);

    /* subjectPublicKeyInfo */
    let spki = r.get_tlv().ok_or(9u8)?;
    process_public_key(&mut cert, spki.value);

    /* extensions */
    if r.remaining() > 0 {
        let extensions = r.get_tlv().ok_or(10u8)?;
        let mut last_oid = String::new();
        process_alt_names(fields, &mut cert, extensions.value, &mut last_oid);
    }

    Ok(cert)
}

/// Walks a Name (SEQUENCE of SET of AttributeTypeAndValue), collecting CN,
/// O, and OU values in order. CN is lowercased: full-Unicode folding for
/// UTF8String values, ASCII folding otherwise. Teletex/Printable values keep
/// their raw bytes and are flagged non-UTF-8.
fn process_rdn(names: &mut CertNames, data: &[u8]) {
    let mut reader = AsnReader::new(data);
    let mut last_oid = String::new();
    while reader.remaining() > 0 {
        let Some(tlv) = reader.get_tlv() else { return };
        if tlv.constructed {
            process_rdn(names, tlv.value);
        } else if tlv.tag == 6 {
            last_oid = decode_oid(tlv.value);
        } else if !last_oid.is_empty()
            && (tlv.tag == TAG_TELETEX_STRING
                || tlv.tag == TAG_PRINTABLE_STRING
                || tlv.tag == TAG_UTF8_STRING)
        {
            let is_utf8_tag = tlv.tag == TAG_UTF8_STRING;
            match last_oid.as_str() {
                OID_COMMON_NAME => {
                    let value = match (is_utf8_tag, std::str::from_utf8(tlv.value)) {
                        (true, Ok(s)) => TaggedString {
                            bytes: s.to_lowercase().into_bytes(),
                            utf8: true,
                        },
                        _ => TaggedString {
                            bytes: ascii_lowercase(tlv.value),
                            utf8: false,
                        },
                    };
                    names.common_name.push(value);
                },
                OID_ORG_NAME => names.org_name.push(attribute_value(&tlv)),
                OID_ORG_UNIT => names.org_unit.push(attribute_value(&tlv)),
                _ => {},
            }
        }
    }
}

fn attribute_value(tlv: &crate::parsers::asn1::Tlv<'_>) -> TaggedString {
    let is_utf8 =
        tlv.tag == TAG_UTF8_STRING && std::str::from_utf8(tlv.value).is_ok();
    TaggedString {
        bytes: tlv.value.to_vec(),
        utf8: is_utf8,
    }
}

/// AlgorithmIdentifier of the subjectPublicKeyInfo. Unknown OIDs map to
/// "unknown", structural damage to "corrupt". EC keys pull the named curve
/// from the following OID.
fn process_public_key(cert: &mut CertInfo, data: &[u8]) {
    let mut reader = AsnReader::new(data);
    let Some(algorithm) = reader.get_tlv() else {
        cert.public_algorithm = Some("corrupt");
        return;
    };
    let mut inner = AsnReader::new(algorithm.value);
    let Some(oid_tlv) = inner.get_tlv() else {
        cert.public_algorithm = Some("corrupt");
        return;
    };
    let algorithm_oid = decode_oid(oid_tlv.value);
    cert.public_algorithm = Some(oid::short_name(&algorithm_oid).unwrap_or("unknown"));

    if algorithm_oid == OID_EC_PUBLIC_KEY {
        match inner.get_tlv() {
            Some(curve_tlv) if curve_tlv.value.len() <= 12 => {
                let curve_oid = decode_oid(curve_tlv.value);
                cert.curve = Some(oid::short_name(&curve_oid).unwrap_or("unknown"));
            },
            _ => cert.curve = Some("corrupt"),
        }
    }
}

/// keyUsage extension body: the OCTET STRING wraps a 4-byte BIT STRING
/// whose final byte carries the CA bit (0x02).
fn process_key_usage(cert: &mut CertInfo, reader: &mut AsnReader<'_>) {
    while reader.remaining() >= 2 {
        let Some(tlv) = reader.get_tlv() else { return };
        if tlv.tag == 4 && tlv.value.len() == 4 {
            cert.is_ca = tlv.value[3] & 0x02 != 0;
        }
    }
}

/// Recursive extension walk tracking the most recently seen OID. Collects
/// DNS subjectAltName entries (tag 2) that are valid UTF-8, ASCII-lowercased;
/// invalid entries tag the session `bad-altname` and are skipped.
fn process_alt_names(
    fields: &mut FieldMap,
    cert: &mut CertInfo,
    data: &[u8],
    last_oid: &mut String,
) {
    let mut reader = AsnReader::new(data);
    while reader.remaining() >= 2 {
        let Some(tlv) = reader.get_tlv() else { return };
        if tlv.constructed {
            process_alt_names(fields, cert, tlv.value, last_oid);
            if !cert.alt.is_empty() {
                return;
            }
        } else if tlv.tag == 6 {
            *last_oid = decode_oid(tlv.value);
            if last_oid == OID_KEY_USAGE {
                process_key_usage(cert, &mut reader);
            }
            if last_oid != OID_SUBJECT_ALT_NAME {
                last_oid.clear();
            }
        } else if !last_oid.is_empty() && tlv.tag == 4 {
            process_alt_names(fields, cert, tlv.value, last_oid);
            return;
        } else if !last_oid.is_empty() && tlv.tag == 2 {
            match std::str::from_utf8(tlv.value) {
                Ok(name) => cert.alt.push(TaggedString {
                    bytes: name.to_ascii_lowercase().into_bytes(),
                    utf8: true,
                }),
                Err(_) => fields.add_tag("bad-altname"),
            }
        }
    }
    last_oid.clear();
}

/// Plugin entry point mirroring the wInfo flow: attaches an annotation to a
/// certificate already held by a session, addressed by its hash.
pub fn update_session_cert_extra(
    fields: &mut FieldMap,
    hash: &str,
    key: &str,
    value: &str,
) -> bool {
    let certs_id = certs_field();
    let Some(FieldValue::Certs(set)) = fields.get_mut(certs_id) else {
        return false;
    };
    for cert in set.iter_mut() {
        if cert.hash == hash {
            cert.update_extra(key, value);
            return true;
        }
    }
    false
}
