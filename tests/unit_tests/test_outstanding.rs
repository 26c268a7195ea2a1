// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use flowcap::{cfg::config::Config, db::SessionSink, session::entry::L4Kind};

use crate::unit_tests::common::{
    RecordingSink, create_at, id_n, udp_proto, worker_with,
};

#[test]
fn test_outstanding_query_defers_save() {
    // S5: finalize with a query in flight; the sink fires exactly once,
    // only after the decrement, and the session is freed right after.
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    worker.get_mut(h).expect("entry").outstanding_queries += 1;

    worker.save(h);
    assert_eq!(sink.save_count(), 0, "save must defer on outstanding query");
    assert_eq!(worker.need_save_count(), 1);
    // already unhooked from table and queues
    assert_eq!(worker.session_count(L4Kind::Udp), 0);
    assert_eq!(worker.active_len(L4Kind::Udp), 0);
    // but still resident
    assert!(worker.get(h).is_some());

    let alive = worker.decrement_outstanding(h);
    assert!(!alive);
    assert_eq!(sink.saves(), vec![(id_n(1).to_hex(), true)]);
    assert_eq!(worker.need_save_count(), 0);
    assert!(worker.get(h).is_none());

    // a second decrement against the freed handle is a no-op
    assert!(!worker.decrement_outstanding(h));
    assert_eq!(sink.save_count(), 1);
}

#[test]
fn test_decrement_without_pending_save_keeps_session() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    worker.get_mut(h).expect("entry").outstanding_queries = 2;

    assert!(worker.decrement_outstanding(h));
    assert!(worker.get(h).is_some());
    assert_eq!(sink.save_count(), 0);
}

#[test]
fn test_two_queries_need_both_completions() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    worker.get_mut(h).expect("entry").outstanding_queries = 2;

    worker.save(h);
    assert_eq!(sink.save_count(), 0);

    assert!(worker.decrement_outstanding(h));
    assert_eq!(sink.save_count(), 0);
    assert!(worker.get(h).is_some());

    assert!(!worker.decrement_outstanding(h));
    assert_eq!(sink.saves(), vec![(id_n(1).to_hex(), true)]);
    assert!(worker.get(h).is_none());
}

#[test]
fn test_save_without_outstanding_is_immediate() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    worker.save(h);

    assert_eq!(sink.saves(), vec![(id_n(1).to_hex(), true)]);
    assert!(worker.get(h).is_none());
    assert_eq!(worker.need_save_count(), 0);
}
