// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared helpers for the unit tests: a recording sink, a single-thread
//! worker builder, and a small DER builder for certificate fixtures.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

use flowcap::{
    cfg::config::Config,
    db::SessionSink,
    session::{
        arena::SessionHandle,
        commands::CommandQueue,
        entry::{L4Kind, PacketTime, SessionEntry},
        id::SessionId,
        protocols,
        stopped::StoppedSet,
        worker::{SaveHooks, Worker, WorkerStats},
    },
};

/// Records every sink call as `(session id hex, is_final)`.
#[derive(Default)]
pub struct RecordingSink {
    saves: Mutex<Vec<(String, bool)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saves(&self) -> Vec<(String, bool)> {
        self.saves.lock().expect("sink poisoned").clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().expect("sink poisoned").len()
    }
}

impl SessionSink for RecordingSink {
    fn save(&self, session: &mut SessionEntry, is_final: bool) {
        self.saves
            .lock()
            .expect("sink poisoned")
            .push((session.session_id.to_hex(), is_final));
    }
}

pub fn worker_with(config: Config, sink: Arc<dyn SessionSink>) -> Worker {
    let stopped = Arc::new(StoppedSet::new(config.stopped_sessions_path()));
    worker_with_stopped(config, sink, stopped)
}

pub fn worker_with_stopped(
    config: Config,
    sink: Arc<dyn SessionSink>,
    stopped: Arc<StoppedSet>,
) -> Worker {
    Worker::new(
        0,
        Arc::new(config),
        sink,
        stopped,
        Arc::new(CommandQueue::new()),
        Arc::new(WorkerStats::new()),
        Arc::new(SaveHooks::default()),
    )
}

pub fn udp_proto() -> protocols::ProtocolId {
    protocols::builtin(L4Kind::Udp)
}

pub fn tcp_proto() -> protocols::ProtocolId {
    protocols::builtin(L4Kind::Tcp)
}

/// Distinct v4 ids: 10.0.0.n:4000 -> 10.0.1.1:80.
pub fn id_n(n: u8) -> SessionId {
    SessionId::v4(
        Ipv4Addr::new(10, 0, 0, n),
        4000,
        Ipv4Addr::new(10, 0, 1, 1),
        80,
    )
}

/// Creates a session and stamps its packet times.
pub fn create_at(
    worker: &mut Worker,
    proto: protocols::ProtocolId,
    id: &SessionId,
    sec: u64,
) -> SessionHandle {
    let (handle, _is_new) = worker.find_or_create(proto, 0, id);
    let entry = worker.get_mut(handle).expect("fresh session");
    entry.first_packet = PacketTime::new(sec, 0);
    entry.last_packet = PacketTime::new(sec, 0);
    handle
}

/// Minimal DER builder for certificate fixtures.
pub mod der {
    pub const OID_CN: &[u8] = &[0x55, 0x04, 0x03];
    pub const OID_O: &[u8] = &[0x55, 0x04, 0x0a];
    pub const OID_OU: &[u8] = &[0x55, 0x04, 0x0b];
    pub const OID_KEY_USAGE: &[u8] = &[0x55, 0x1d, 0x0f];
    pub const OID_SAN: &[u8] = &[0x55, 0x1d, 0x11];
    pub const OID_RSA: &[u8] =
        &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
    pub const OID_EC: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
    pub const OID_P256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

    pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 128 {
            out.push(len as u8);
        } else if len < 256 {
            out.extend([0x81, len as u8]);
        } else {
            out.extend([0x82, (len >> 8) as u8, len as u8]);
        }
        out.extend_from_slice(content);
        out
    }

    pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    pub fn seq(parts: &[&[u8]]) -> Vec<u8> {
        tlv(0x30, &concat(parts))
    }

    pub fn set_of(parts: &[&[u8]]) -> Vec<u8> {
        tlv(0x31, &concat(parts))
    }

    pub fn oid(bytes: &[u8]) -> Vec<u8> {
        tlv(0x06, bytes)
    }

    pub fn integer(bytes: &[u8]) -> Vec<u8> {
        tlv(0x02, bytes)
    }

    pub fn printable(s: &[u8]) -> Vec<u8> {
        tlv(0x13, s)
    }

    pub fn utf8(s: &str) -> Vec<u8> {
        tlv(0x0c, s.as_bytes())
    }

    pub fn octet(bytes: &[u8]) -> Vec<u8> {
        tlv(0x04, bytes)
    }

    pub fn utc_time(s: &str) -> Vec<u8> {
        tlv(0x17, s.as_bytes())
    }

    pub fn null() -> Vec<u8> {
        tlv(0x05, &[])
    }

    pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
        let mut content = vec![0u8];
        content.extend_from_slice(bytes);
        tlv(0x03, &content)
    }

    /// One AttributeTypeAndValue wrapped in its RDN SET.
    pub fn rdn(attr_oid: &[u8], value: Vec<u8>) -> Vec<u8> {
        set_of(&[&seq(&[&oid(attr_oid), &value])])
    }

    /// A Name: SEQUENCE of RDNs.
    pub fn name(rdns: &[&[u8]]) -> Vec<u8> {
        seq(rdns)
    }

    pub fn spki_rsa() -> Vec<u8> {
        seq(&[&seq(&[&oid(OID_RSA), &null()]), &bit_string(&[0xaa; 8])])
    }

    pub fn spki_ec_p256() -> Vec<u8> {
        seq(&[&seq(&[&oid(OID_EC), &oid(OID_P256)]), &bit_string(&[0xbb; 8])])
    }

    /// subjectAltName extension with raw dNSName byte strings.
    pub fn san_extension(dns_names: &[&[u8]]) -> Vec<u8> {
        let names: Vec<Vec<u8>> = dns_names.iter().map(|n| tlv(0x82, n)).collect();
        let name_refs: Vec<&[u8]> = names.iter().map(|n| n.as_slice()).collect();
        let general_names = seq(&name_refs);
        seq(&[&oid(OID_SAN), &octet(&general_names)])
    }

    /// keyUsage extension whose BIT STRING final byte carries the CA bit.
    pub fn key_usage_extension(ca: bool) -> Vec<u8> {
        let bits = if ca { 0x02 } else { 0x00 };
        seq(&[&oid(OID_KEY_USAGE), &octet(&[0x03, 0x02, 0x01, bits])])
    }

    /// The `[3] Extensions` wrapper.
    pub fn extensions(exts: &[&[u8]]) -> Vec<u8> {
        tlv(0xa3, &seq(exts))
    }

    /// A complete certificate. `extensions` is the already-wrapped `[3]`
    /// node.
    pub fn certificate(
        serial: &[u8],
        issuer: &[u8],
        subject: &[u8],
        not_before: &str,
        not_after: &str,
        spki: &[u8],
        extensions: Option<&[u8]>,
    ) -> Vec<u8> {
        let validity = seq(&[&utc_time(not_before), &utc_time(not_after)]);
        let sig_alg = seq(&[&oid(OID_RSA), &null()]);
        let mut tbs_parts: Vec<&[u8]> = Vec::new();
        let serial_tlv = integer(serial);
        tbs_parts.push(&serial_tlv);
        tbs_parts.push(&sig_alg);
        tbs_parts.push(issuer);
        tbs_parts.push(&validity);
        tbs_parts.push(subject);
        tbs_parts.push(spki);
        if let Some(ext) = extensions {
            tbs_parts.push(ext);
        }
        let tbs = seq(&tbs_parts);
        let signature = bit_string(&[0xcc; 16]);
        seq(&[&tbs, &sig_alg, &signature])
    }

    /// TLS handshake certificate-chain payload: 3-byte total length, then
    /// `(3-byte length, DER)` records.
    pub fn chain(certs: &[&[u8]]) -> Vec<u8> {
        let total: usize = certs.iter().map(|c| c.len() + 3).sum();
        let mut out = vec![
            (total >> 16) as u8,
            (total >> 8) as u8,
            total as u8,
        ];
        for cert in certs {
            let len = cert.len();
            out.extend([(len >> 16) as u8, (len >> 8) as u8, len as u8]);
            out.extend_from_slice(cert);
        }
        out
    }

    /// `example.com`-shaped subject/issuer with a single CN.
    pub fn cn_name(cn: &str) -> Vec<u8> {
        name(&[&rdn(OID_CN, utf8(cn))])
    }
}
