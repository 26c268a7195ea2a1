// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Short names for the OIDs certificates actually carry: public-key
//! algorithms and named curves. Names follow the OpenSSL short-name
//! convention so downstream dashboards keep matching.

pub const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

pub const OID_COMMON_NAME: &str = "2.5.4.3";
pub const OID_ORG_NAME: &str = "2.5.4.10";
pub const OID_ORG_UNIT: &str = "2.5.4.11";
pub const OID_KEY_USAGE: &str = "2.5.29.15";
pub const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

pub fn short_name(oid: &str) -> Option<&'static str> {
    Some(match oid {
        // public key algorithms
        "1.2.840.113549.1.1.1" => "rsaEncryption",
        "1.2.840.113549.1.1.10" => "RSASSA-PSS",
        "1.2.840.10040.4.1" => "DSA",
        "1.2.840.10046.2.1" => "X9.42 DH",
        OID_EC_PUBLIC_KEY => "id-ecPublicKey",
        "1.3.101.110" => "X25519",
        "1.3.101.111" => "X448",
        "1.3.101.112" => "ED25519",
        "1.3.101.113" => "ED448",
        // named curves
        "1.2.840.10045.3.1.1" => "prime192v1",
        "1.2.840.10045.3.1.7" => "prime256v1",
        "1.3.132.0.10" => "secp256k1",
        "1.3.132.0.33" => "secp224r1",
        "1.3.132.0.34" => "secp384r1",
        "1.3.132.0.35" => "secp521r1",
        "1.3.36.3.3.2.8.1.1.7" => "brainpoolP256r1",
        "1.3.36.3.3.2.8.1.1.11" => "brainpoolP384r1",
        "1.3.36.3.3.2.8.1.1.13" => "brainpoolP512r1",
        _ => return None,
    })
}
