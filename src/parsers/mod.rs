// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Name-indexed parser dispatch.
//!
//! Protocol parsers register under well-known names and are invoked by the
//! packet pipeline or by other parsers. A name can be resolved before
//! anything registers under it; calling such an id is a no-op until a
//! registrant appears. Multiple registrants per name are invoked in
//! registration order.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use once_cell::sync::Lazy;

use crate::session::entry::SessionEntry;

/// ASN.1 TLV reading, OID decoding, and time parsing.
pub mod asn1;
/// TLS server-certificate parsing.
pub mod certs;
/// OID short names.
pub mod oid;

pub type NamedFuncId = usize;

pub type NamedFunc =
    Arc<dyn Fn(&mut SessionEntry, &[u8], Option<&dyn Any>) + Send + Sync>;

#[derive(Default)]
struct NamedRegistry {
    by_name: HashMap<String, NamedFuncId>,
    funcs: Vec<Vec<NamedFunc>>,
}

static NAMED: Lazy<RwLock<NamedRegistry>> =
    Lazy::new(|| RwLock::new(NamedRegistry::default()));

fn slot_for(reg: &mut NamedRegistry, name: &str) -> NamedFuncId {
    if let Some(id) = reg.by_name.get(name) {
        return *id;
    }
    let id = reg.funcs.len();
    reg.funcs.push(Vec::new());
    reg.by_name.insert(name.to_string(), id);
    id
}

/// Resolves a name to a callable id, reserving a slot if nothing has
/// registered under it yet.
pub fn get_named_func(name: &str) -> NamedFuncId {
    let mut reg = NAMED.write().unwrap_or_else(PoisonError::into_inner);
    slot_for(&mut reg, name)
}

/// Registers a parser under `name` and returns the shared id.
pub fn add_named_func(
    name: &str,
    func: impl Fn(&mut SessionEntry, &[u8], Option<&dyn Any>) + Send + Sync + 'static,
) -> NamedFuncId {
    let mut reg = NAMED.write().unwrap_or_else(PoisonError::into_inner);
    let id = slot_for(&mut reg, name);
    reg.funcs[id].push(Arc::new(func));
    id
}

/// Invokes every registrant of `id` with the payload and optional context
/// value.
pub fn call_named_func(
    id: NamedFuncId,
    session: &mut SessionEntry,
    data: &[u8],
    uw: Option<&dyn Any>,
) {
    let funcs: Vec<NamedFunc> = {
        let reg = NAMED.read().unwrap_or_else(PoisonError::into_inner);
        match reg.funcs.get(id) {
            Some(list) => list.clone(),
            None => return,
        }
    };
    for func in funcs {
        func(session, data, uw);
    }
}

/// Name-based call, resolving the id on the fly.
pub fn call_named(
    name: &str,
    session: &mut SessionEntry,
    data: &[u8],
    uw: Option<&dyn Any>,
) {
    let id = get_named_func(name);
    call_named_func(id, session, data, uw);
}
