// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::BytesMut;
use flowcap::{
    parsers::certs::{CertInfo, CertNames},
    session::fields::TaggedString,
};
use serde_json::Value;

fn named(strings: &[&str]) -> Vec<TaggedString> {
    strings.iter().map(|s| TaggedString::utf8(*s)).collect()
}

fn sample_cert() -> CertInfo {
    CertInfo {
        not_before: 1_672_531_200, // 2023-01-01
        not_after: 1_767_225_600,  // 2026-01-01
        issuer: CertNames {
            common_name: named(&["example ca"]),
            org_name: named(&["Example Org"]),
            ..CertNames::default()
        },
        subject: CertNames {
            common_name: named(&["example.com"]),
            ..CertNames::default()
        },
        alt: named(&["www.example.com", "example.com"]),
        serial: vec![0x0a, 0xbc, 0xde],
        hash: "aa:".repeat(19) + "aa",
        is_ca: false,
        public_algorithm: Some("rsaEncryption"),
        curve: None,
        extra: None,
    }
}

fn render(cert: &CertInfo, first_packet_sec: u64) -> Value {
    let mut buf = BytesMut::new();
    cert.save_json(&mut buf, first_packet_sec);
    serde_json::from_slice(&buf).expect("projection must be valid JSON")
}

#[test]
fn test_projection_roundtrip() {
    // Property 6: hash and alt names survive (order preserved).
    let cert = sample_cert();
    let value = render(&cert, 1_700_000_000);

    assert_eq!(value["hash"].as_str().expect("hash"), cert.hash);
    let alts: Vec<&str> = value["alt"]
        .as_array()
        .expect("alt array")
        .iter()
        .map(|v| v.as_str().expect("alt entry"))
        .collect();
    assert_eq!(alts, vec!["www.example.com", "example.com"]);
    assert_eq!(value["altCnt"].as_i64(), Some(2));

    assert_eq!(value["issuerCN"][0].as_str(), Some("example ca"));
    assert_eq!(value["issuerON"][0].as_str(), Some("Example Org"));
    assert!(value.get("issuerOU").is_none());
    assert!(value.get("subjectON").is_none());
    assert_eq!(value["subjectCN"][0].as_str(), Some("example.com"));
    assert_eq!(value["serial"].as_str(), Some("0abcde"));
    assert_eq!(value["publicAlgorithm"].as_str(), Some("rsaEncryption"));
    assert!(value.get("curve").is_none());
}

#[test]
fn test_validity_numbers_are_milliseconds_and_seconds() {
    let cert = sample_cert();
    let first = 1_700_000_000u64;
    let value = render(&cert, first);

    assert_eq!(value["notBefore"].as_i64(), Some(1_672_531_200_000));
    assert_eq!(value["notAfter"].as_i64(), Some(1_767_225_600_000));

    let remaining = 1_767_225_600 - first as i64;
    assert_eq!(value["remainingSeconds"].as_i64(), Some(remaining));
    assert_eq!(value["remainingDays"].as_i64(), Some(remaining / 86_400));

    let valid = 1_767_225_600 - 1_672_531_200i64;
    assert_eq!(value["validSeconds"].as_i64(), Some(valid));
    assert_eq!(value["validDays"].as_i64(), Some(valid / 86_400));
}

#[test]
fn test_expired_certificate_remaining_is_zero() {
    let cert = sample_cert();
    // first packet after notAfter
    let value = render(&cert, 1_800_000_000);
    assert_eq!(value["remainingDays"].as_i64(), Some(0));
    assert_eq!(value["remainingSeconds"].as_i64(), Some(0));
}

#[test]
fn test_empty_serial_and_names_omitted() {
    let cert = CertInfo {
        hash: "bb:".repeat(19) + "bb",
        not_before: 100,
        not_after: 200,
        ..CertInfo::default()
    };
    let value = render(&cert, 50);
    assert!(value.get("serial").is_none());
    assert!(value.get("issuerCN").is_none());
    assert!(value.get("alt").is_none());
    assert!(value.get("altCnt").is_none());
    assert!(value.get("publicAlgorithm").is_none());
}

#[test]
fn test_non_utf8_strings_escape_quoted() {
    let cert = CertInfo {
        hash: "cc:".repeat(19) + "cc",
        subject: CertNames {
            org_name: vec![TaggedString::raw(vec![0x41, 0xff, 0x42])],
            ..CertNames::default()
        },
        ..CertInfo::default()
    };
    let value = render(&cert, 0);
    assert_eq!(value["subjectON"][0].as_str(), Some("A\u{ff}B"));
}

#[test]
fn test_extra_entries_append_in_order() {
    let mut cert = sample_cert();
    cert.update_extra("vendor", "acme");
    cert.update_extra("notes", "with \"quotes\"");
    let value = render(&cert, 1_700_000_000);
    assert_eq!(value["vendor"].as_str(), Some("acme"));
    assert_eq!(value["notes"].as_str(), Some("with \"quotes\""));

    let mut buf = BytesMut::new();
    cert.save_json(&mut buf, 1_700_000_000);
    let raw = String::from_utf8_lossy(&buf).into_owned();
    assert!(raw.find("\"vendor\"").expect("vendor") < raw.find("\"notes\"").expect("notes"));
    assert!(raw.ends_with('}'));
    assert!(!raw.contains(",}"));
}
