// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use flowcap::{
    cfg::config::Config,
    session::commands::{Command, CommandQueue},
};

use crate::unit_tests::common::{
    RecordingSink, create_at, id_n, udp_proto, worker_with,
};

#[test]
fn test_commands_run_in_arrival_order() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), sink);
    let queue = Arc::clone(worker.command_queue());

    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..5usize {
        let order = Arc::clone(&order);
        queue.push(Command::for_thread(move |_w| {
            order.lock().expect("order").push(n);
        }));
    }
    assert_eq!(queue.len(), 5);

    worker.tick();
    assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3, 4]);
    assert!(queue.is_empty());
}

#[test]
fn test_command_limit_is_fifty_per_tick() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), sink);
    let queue = Arc::clone(worker.command_queue());

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..60 {
        let ran = Arc::clone(&ran);
        queue.push(Command::for_thread(move |_w| {
            ran.fetch_add(1, Ordering::Relaxed);
        }));
    }

    worker.tick();
    assert_eq!(ran.load(Ordering::Relaxed), 50);
    assert_eq!(queue.len(), 10);

    worker.tick();
    assert_eq!(ran.load(Ordering::Relaxed), 60);
}

#[test]
fn test_session_command_reaches_session() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), sink);
    let queue = Arc::clone(worker.command_queue());

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    queue.push(Command::for_session(h, |w, handle| {
        w.get_mut(handle).expect("session").add_tag("from-command");
    }));
    worker.tick();

    assert!(worker.get(h).expect("session").has_tag("from-command"));
}

#[test]
fn test_stale_session_command_is_dropped() {
    let sink = RecordingSink::new();
    let mut worker = worker_with(Config::default(), sink);
    let queue = Arc::clone(worker.command_queue());

    let h = create_at(&mut worker, udp_proto(), &id_n(1), 100);
    worker.save(h);
    assert!(worker.get(h).is_none());

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in_cmd = Arc::clone(&ran);
    queue.push(Command::for_session(h, move |_w, _handle| {
        ran_in_cmd.fetch_add(1, Ordering::Relaxed);
    }));
    worker.tick();
    assert_eq!(ran.load(Ordering::Relaxed), 0);
}

#[test]
fn test_cross_thread_producers_interleave_safely() {
    let queue = Arc::new(CommandQueue::new());
    let mut producers = Vec::new();
    for p in 0..4u8 {
        let queue = Arc::clone(&queue);
        producers.push(std::thread::spawn(move || {
            for i in 0..25u8 {
                queue.push(Command::for_thread(move |_w| {
                    let _ = (p, i);
                }));
            }
        }));
    }
    for producer in producers {
        producer.join().expect("producer thread");
    }
    assert_eq!(queue.len(), 100);
}
