// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex, atomic::AtomicUsize, atomic::Ordering};

use flowcap::{cfg::config::Config, db::SessionSink, session::entry::SessionEntry};

/// Thread-safe recording sink shared across the engine's workers.
#[derive(Default)]
pub struct CountingSink {
    saves: Mutex<Vec<(String, bool)>>,
    finals: AtomicUsize,
}

impl CountingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn final_saves(&self) -> usize {
        self.finals.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> Vec<(String, bool)> {
        self.saves.lock().expect("sink poisoned").clone()
    }
}

impl SessionSink for CountingSink {
    fn save(&self, session: &mut SessionEntry, is_final: bool) {
        if is_final {
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
        self.saves
            .lock()
            .expect("sink poisoned")
            .push((session.session_id.to_hex(), is_final));
    }
}

/// Engine config with a per-process node name so stopped-sessions files
/// from parallel test runs never collide.
pub fn engine_config(threads: u16, tag: &str) -> Config {
    let mut cfg = Config::default();
    cfg.packet_threads = threads;
    cfg.node_name = format!("flowcap-it-{}-{}", tag, std::process::id());
    cfg
}
