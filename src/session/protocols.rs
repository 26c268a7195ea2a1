// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol registry.
//!
//! The packet pipeline resolves each flow to a registered protocol; the
//! protocol fixes the session's L4 kind, which in turn selects the queue and
//! timeout policy.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use once_cell::sync::Lazy;

use crate::session::entry::L4Kind;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ProtocolId(pub u8);

struct ProtocolDef {
    name: String,
    kind: L4Kind,
}

#[derive(Default)]
struct ProtocolRegistry {
    defs: Vec<ProtocolDef>,
    by_name: HashMap<String, ProtocolId>,
}

static REGISTRY: Lazy<RwLock<ProtocolRegistry>> =
    Lazy::new(|| RwLock::new(ProtocolRegistry::default()));

/// Registers a protocol, returning its id. Idempotent by name.
pub fn register_protocol(name: &str, kind: L4Kind) -> ProtocolId {
    let mut reg = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(id) = reg.by_name.get(name) {
        return *id;
    }
    let id = ProtocolId(reg.defs.len() as u8);
    reg.defs.push(ProtocolDef {
        name: name.to_string(),
        kind,
    });
    reg.by_name.insert(name.to_string(), id);
    id
}

/// L4 kind of a registered protocol; unknown ids fall back to `Other`.
pub fn kind_of(protocol: ProtocolId) -> L4Kind {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .defs
        .get(protocol.0 as usize)
        .map(|d| d.kind)
        .unwrap_or(L4Kind::Other)
}

pub fn name_of(protocol: ProtocolId) -> Option<String> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .defs
        .get(protocol.0 as usize)
        .map(|d| d.name.clone())
}

/// The base protocol for an L4 kind, registered on first use.
pub fn builtin(kind: L4Kind) -> ProtocolId {
    register_protocol(kind.name(), kind)
}
