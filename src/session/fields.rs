// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sparse per-session field storage.
//!
//! Fields are registered once per process and addressed by a small integer
//! id; sessions carry an ordered sparse map from field id to value. String
//! values keep their raw bytes plus a UTF-8 validity flag because attribute
//! values decoded from certificates are not always UTF-8.

use std::{
    collections::{BTreeMap, HashMap, btree_map},
    sync::{PoisonError, RwLock},
};

use once_cell::sync::{Lazy, OnceCell};

use crate::parsers::certs::CertSet;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct FieldId(pub u16);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldKind {
    Str,
    StrArray,
    StrSet,
    Int,
    CertObjects,
}

struct FieldDef {
    name: String,
    kind: FieldKind,
}

#[derive(Default)]
struct FieldRegistry {
    defs: Vec<FieldDef>,
    by_name: HashMap<String, FieldId>,
}

static REGISTRY: Lazy<RwLock<FieldRegistry>> =
    Lazy::new(|| RwLock::new(FieldRegistry::default()));

/// Registers a field, returning its id. Idempotent by name; a repeated
/// definition with a different kind keeps the original.
pub fn define(name: &str, kind: FieldKind) -> FieldId {
    let mut reg = REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(id) = reg.by_name.get(name) {
        return *id;
    }
    let id = FieldId(reg.defs.len() as u16);
    reg.defs.push(FieldDef {
        name: name.to_string(),
        kind,
    });
    reg.by_name.insert(name.to_string(), id);
    id
}

pub fn lookup(name: &str) -> Option<FieldId> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .by_name
        .get(name)
        .copied()
}

pub fn kind_of(id: FieldId) -> Option<FieldKind> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .defs
        .get(id.0 as usize)
        .map(|d| d.kind)
}

pub fn name_of(id: FieldId) -> Option<String> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .defs
        .get(id.0 as usize)
        .map(|d| d.name.clone())
}

static TAGS_FIELD: OnceCell<FieldId> = OnceCell::new();
static PROTOCOLS_FIELD: OnceCell<FieldId> = OnceCell::new();

/// Builtin string-set field holding session tags.
pub fn tags_field() -> FieldId {
    *TAGS_FIELD.get_or_init(|| define("tags", FieldKind::StrSet))
}

/// Builtin string-set field holding protocols seen on the session.
pub fn protocols_field() -> FieldId {
    *PROTOCOLS_FIELD.get_or_init(|| define("protocols", FieldKind::StrSet))
}

/// A byte string plus a UTF-8 validity flag. Raw (non-UTF-8) strings are
/// preserved byte-for-byte and escape-quoted by the sink encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedString {
    pub bytes: Vec<u8>,
    pub utf8: bool,
}

impl TaggedString {
    pub fn utf8(s: impl Into<String>) -> Self {
        Self {
            bytes: s.into().into_bytes(),
            utf8: true,
        }
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Self { bytes, utf8: false }
    }

    pub fn as_str(&self) -> Option<&str> {
        if self.utf8 {
            std::str::from_utf8(&self.bytes).ok()
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub enum FieldValue {
    Str(TaggedString),
    StrArray(Vec<TaggedString>),
    /// Insertion-ordered, deduplicated.
    StrSet(Vec<TaggedString>),
    Int(u32),
    Certs(CertSet),
}

#[derive(Default, Debug)]
pub struct FieldMap {
    values: BTreeMap<FieldId, FieldValue>,
}

impl FieldMap {
    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(&id)
    }

    pub fn get_mut(&mut self, id: FieldId) -> Option<&mut FieldValue> {
        self.values.get_mut(&id)
    }

    pub fn insert(&mut self, id: FieldId, value: FieldValue) {
        self.values.insert(id, value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FieldId, FieldValue> {
        self.values.iter()
    }

    /// Appends to a string-set field, deduplicating on the raw bytes.
    /// Returns false when the value was already present.
    pub fn add_string_to_set(&mut self, id: FieldId, value: TaggedString) -> bool {
        let entry = self
            .values
            .entry(id)
            .or_insert_with(|| FieldValue::StrSet(Vec::new()));
        match entry {
            FieldValue::StrSet(set) => {
                if set.iter().any(|s| s.bytes == value.bytes) {
                    return false;
                }
                set.push(value);
                true
            },
            _ => false,
        }
    }

    pub fn set_contains(&self, id: FieldId, bytes: &[u8]) -> bool {
        match self.values.get(&id) {
            Some(FieldValue::StrSet(set)) => set.iter().any(|s| s.bytes == bytes),
            _ => false,
        }
    }

    pub fn add_tag(&mut self, tag: &str) {
        self.add_string_to_set(tags_field(), TaggedString::utf8(tag));
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.set_contains(tags_field(), tag.as_bytes())
    }

    pub fn add_protocol(&mut self, protocol: &str) {
        self.add_string_to_set(protocols_field(), TaggedString::utf8(protocol));
    }

    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.set_contains(protocols_field(), protocol.as_bytes())
    }

    /// The certificate object set for `id`, created on first use.
    pub fn certs_entry(&mut self, id: FieldId) -> &mut CertSet {
        let entry = self
            .values
            .entry(id)
            .or_insert_with(|| FieldValue::Certs(CertSet::default()));
        match entry {
            FieldValue::Certs(set) => set,
            // A field id is bound to one kind at registration; reaching here
            // means two registrations shared an id.
            other => panic!("field {id:?} holds {other:?}, expected certificates"),
        }
    }

    pub fn certs(&self, id: FieldId) -> Option<&CertSet> {
        match self.values.get(&id) {
            Some(FieldValue::Certs(set)) => Some(set),
            _ => None,
        }
    }
}
