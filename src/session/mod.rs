// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Generational session arena and intrusive handle lists.
pub mod arena;
/// Cross-thread command queues.
pub mod commands;
/// Worker-pool lifecycle: spawn, flush, shutdown.
pub mod engine;
/// Per-flow session state.
pub mod entry;
/// Sparse field map and field registry.
pub mod fields;
/// Canonical 5-tuple session ids and hashing.
pub mod id;
/// Protocol registry mapping parser protocols onto L4 kinds.
pub mod protocols;
/// Persisted stopped-sessions side table.
pub mod stopped;
/// Closed-addressing session hash tables.
pub mod table;
/// Per-thread session owner: lookup, eviction, saves.
pub mod worker;
