// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use flowcap::session::{
    commands::Command,
    engine::Engine,
    entry::{L4Kind, PacketTime},
    id::SessionId,
    protocols,
    worker::SaveHooks,
};
use serial_test::serial;

use crate::integration_tests::common::{CountingSink, engine_config};

fn ids(count: u8) -> Vec<SessionId> {
    (1..=count)
        .map(|n| {
            SessionId::v4(
                Ipv4Addr::new(10, 9, 0, n),
                40_000 + u16::from(n),
                Ipv4Addr::new(192, 0, 2, 1),
                443,
            )
        })
        .collect()
}

fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    ready()
}

#[test]
#[serial]
fn test_sessions_live_on_their_hash_thread() {
    let sink = CountingSink::new();
    let mut engine = Engine::start(
        engine_config(3, "affinity"),
        Arc::clone(&sink) as Arc<dyn flowcap::db::SessionSink>,
        SaveHooks::default(),
    )
    .expect("engine");

    let proto = protocols::builtin(L4Kind::Udp);
    for id in ids(12) {
        let thread = engine.thread_for(&id);
        engine.dispatch(
            thread,
            Command::for_thread(move |worker| {
                let (handle, is_new) = worker.find_or_create(proto, 0, &id);
                assert!(is_new);
                let entry = worker.get_mut(handle).expect("fresh session");
                entry.first_packet = PacketTime::new(100, 0);
                entry.last_packet = PacketTime::new(100, 0);
            }),
        );
    }

    assert!(wait_until(Duration::from_secs(5), || {
        engine.monitoring_count() == 12
    }));
    assert_eq!(engine.watch_count(L4Kind::Udp), 12);
    assert_eq!(engine.watch_count(L4Kind::Tcp), 0);
    assert_eq!(engine.close_outstanding(), 0);

    engine.shutdown();
    assert_eq!(engine.monitoring_count(), 0);
    assert_eq!(sink.final_saves(), 12);
}

#[test]
#[serial]
fn test_flush_drains_all_workers() {
    let sink = CountingSink::new();
    let mut engine = Engine::start(
        engine_config(2, "flush"),
        Arc::clone(&sink) as Arc<dyn flowcap::db::SessionSink>,
        SaveHooks::default(),
    )
    .expect("engine");

    let proto = protocols::builtin(L4Kind::Tcp);
    for id in ids(8) {
        let thread = engine.thread_for(&id);
        engine.dispatch(
            thread,
            Command::for_thread(move |worker| {
                let (handle, _) = worker.find_or_create(proto, 0, &id);
                let entry = worker.get_mut(handle).expect("session");
                entry.last_packet = PacketTime::new(50, 0);
            }),
        );
    }
    assert!(wait_until(Duration::from_secs(5), || {
        engine.monitoring_count() == 8
    }));

    engine.flush();
    assert!(wait_until(Duration::from_secs(5), || {
        engine.monitoring_count() == 0
    }));
    assert_eq!(sink.final_saves(), 8);
    assert!(sink.saves().iter().all(|(_, is_final)| *is_final));
    assert_eq!(engine.command_outstanding(), 0);

    engine.shutdown();
    assert_eq!(sink.final_saves(), 8, "shutdown must not double-save");
}

#[test]
#[serial]
fn test_deferred_save_completes_via_command_queue() {
    let sink = CountingSink::new();
    let mut engine = Engine::start(
        engine_config(1, "deferred"),
        Arc::clone(&sink) as Arc<dyn flowcap::db::SessionSink>,
        SaveHooks::default(),
    )
    .expect("engine");

    let id = ids(1).remove(0);
    let proto = protocols::builtin(L4Kind::Udp);
    let handle_slot = Arc::new(std::sync::Mutex::new(None));

    // create with one query in flight, then finalize: the save defers
    let slot = Arc::clone(&handle_slot);
    engine.dispatch(
        0,
        Command::for_thread(move |worker| {
            let (handle, _) = worker.find_or_create(proto, 0, &id);
            worker.get_mut(handle).expect("session").outstanding_queries = 1;
            worker.save(handle);
            *slot.lock().expect("slot") = Some(handle);
        }),
    );
    assert!(wait_until(Duration::from_secs(5), || {
        engine.need_save_outstanding() == 1
    }));
    assert_eq!(sink.final_saves(), 0);

    // the async completion re-enters through the owner's command queue
    let handle = handle_slot
        .lock()
        .expect("slot")
        .take()
        .expect("handle recorded");
    engine.dispatch(
        0,
        Command::for_session(handle, |worker, h| {
            worker.decrement_outstanding(h);
        }),
    );
    assert!(wait_until(Duration::from_secs(5), || {
        engine.need_save_outstanding() == 0
    }));
    assert_eq!(sink.final_saves(), 1);

    engine.shutdown();
    assert_eq!(sink.final_saves(), 1, "deferred save fires exactly once");
}
