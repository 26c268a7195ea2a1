// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use flowcap::{
    cfg::config::Config,
    db::SessionSink,
    session::entry::{L4Kind, RootId, TcpFlagKind},
};

use crate::unit_tests::common::{
    RecordingSink, create_at, id_n, tcp_proto, worker_with,
};

#[test]
fn test_checkpoint_resets_counters_but_keeps_session() {
    let mut config = Config::default();
    config.tcp_save_timeout = 400;
    let sink = RecordingSink::new();
    let mut worker = worker_with(config, Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, tcp_proto(), &id_n(1), 100);
    {
        let entry = worker.get_mut(h).expect("entry");
        entry.packets = [10, 20];
        entry.bytes = [1000, 2000];
        entry.data_bytes = [800, 1600];
        entry.syn_time = 7;
        entry.ack_time = 8;
        entry.file_positions.extend([1u64, 2, 3]);
        entry.file_numbers.push(4);
        entry.last_file_num = 4;
        entry.note_tcp_flag(TcpFlagKind::Syn);
        entry.add_tag("interesting");
    }
    worker.enqueue_tcp_write(h);

    // due at 100 + 400 < now
    worker.set_last_packet_secs(501);
    worker.tick();

    assert_eq!(sink.saves(), vec![(id_n(1).to_hex(), false)]);
    let entry = worker.get(h).expect("session survives a checkpoint");
    assert_eq!(entry.packets, [0, 0]);
    assert_eq!(entry.bytes, [0, 0]);
    assert_eq!(entry.data_bytes, [0, 0]);
    assert_eq!(entry.syn_time, 0);
    assert_eq!(entry.ack_time, 0);
    assert!(entry.file_positions.is_empty());
    assert!(entry.file_numbers.is_empty());
    assert_eq!(entry.last_file_num, 0);
    assert_eq!(entry.tcp_flag_counts, [0; 8]);
    // retained
    assert!(entry.has_tag("interesting"));
    assert_eq!(entry.first_packet.sec, 100);
    assert_eq!(entry.root_id, RootId::Own);
    // rescheduled
    assert_eq!(entry.save_time, 501 + 400);
    assert_eq!(worker.tcp_write_len(), 1);
    assert_eq!(worker.session_count(L4Kind::Tcp), 1);
}

#[test]
fn test_checkpoint_not_due_does_nothing() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), Arc::clone(&sink) as Arc<dyn SessionSink>);

    let h = create_at(&mut worker, tcp_proto(), &id_n(1), 100);
    worker.enqueue_tcp_write(h);

    worker.set_last_packet_secs(200);
    worker.tick();
    assert_eq!(sink.save_count(), 0);
}

#[test]
fn test_tcp_write_queue_rejects_non_tcp() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), sink);

    let udp = crate::unit_tests::common::udp_proto();
    let h = create_at(&mut worker, udp, &id_n(1), 100);
    worker.enqueue_tcp_write(h);
    assert_eq!(worker.tcp_write_len(), 0);
}

#[test]
fn test_checkpoint_ordering_is_by_recency() {
    let mut config = Config::default();
    config.tcp_save_timeout = 100;
    let sink = RecordingSink::new();
    let mut worker = worker_with(config, Arc::clone(&sink) as Arc<dyn SessionSink>);

    let a = create_at(&mut worker, tcp_proto(), &id_n(1), 100);
    let b = create_at(&mut worker, tcp_proto(), &id_n(2), 150);
    worker.enqueue_tcp_write(a);
    worker.enqueue_tcp_write(b);

    // only a (due at 200) has expired at 201; b is due at 250
    worker.set_last_packet_secs(201);
    worker.tick();
    assert_eq!(sink.saves(), vec![(id_n(1).to_hex(), false)]);

    // after its checkpoint, a sits behind b with a fresh deadline
    worker.set_last_packet_secs(251);
    worker.tick();
    assert_eq!(
        sink.saves(),
        vec![(id_n(1).to_hex(), false), (id_n(2).to_hex(), false)]
    );
}
