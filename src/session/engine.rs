// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Worker-pool lifecycle.
//!
//! The engine spawns one worker loop per configured packet thread plus the
//! stopped-set flusher, routes cross-thread commands, and aggregates the
//! per-worker diagnostics. Shutdown enqueues a flush-close command to every
//! worker, waits for the command / closing / deferred-save counters to
//! drain, then tears the threads down.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    db::SessionSink,
    session::{
        commands::{Command, CommandQueue},
        entry::L4Kind,
        id::SessionId,
        stopped::StoppedSet,
        worker::{SaveHooks, Worker, WorkerStats},
    },
};

const STOPPED_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const WORKER_WAIT: Duration = Duration::from_millis(100);
const SHUTDOWN_DRAIN_CAP: Duration = Duration::from_secs(30);

pub struct Engine {
    config: Arc<Config>,
    queues: Vec<Arc<CommandQueue>>,
    stats: Vec<Arc<WorkerStats>>,
    stopped: Arc<StoppedSet>,
    quitting: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    flusher: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Validates the config, loads the stopped-sessions table, registers the
    /// builtin parsers, and spawns the worker pool.
    pub fn start(
        mut config: Config,
        sink: Arc<dyn SessionSink>,
        hooks: SaveHooks,
    ) -> Result<Self> {
        config.validate_and_normalize()?;
        crate::parsers::certs::init();

        let config = Arc::new(config);
        let hooks = Arc::new(hooks);
        let stopped = Arc::new(StoppedSet::new(config.stopped_sessions_path()));
        stopped.load();
        let quitting = Arc::new(AtomicBool::new(false));

        let mut queues = Vec::with_capacity(config.packet_threads as usize);
        let mut stats = Vec::with_capacity(config.packet_threads as usize);
        let mut workers = Vec::with_capacity(config.packet_threads as usize);

        for t in 0..config.packet_threads {
            let queue = Arc::new(CommandQueue::new());
            let stat = Arc::new(WorkerStats::new());
            queues.push(Arc::clone(&queue));
            stats.push(Arc::clone(&stat));

            let config = Arc::clone(&config);
            let sink = Arc::clone(&sink);
            let stopped = Arc::clone(&stopped);
            let hooks = Arc::clone(&hooks);
            let quitting = Arc::clone(&quitting);

            let handle = thread::Builder::new()
                .name(format!("flowcap-worker-{t}"))
                .spawn(move || {
                    let mut worker = Worker::new(
                        t,
                        config,
                        sink,
                        stopped,
                        Arc::clone(&queue),
                        stat,
                        hooks,
                    );
                    loop {
                        queue.wait(WORKER_WAIT);
                        worker.tick();
                        if quitting.load(Ordering::Relaxed) && queue.is_empty() {
                            break;
                        }
                    }
                })
                .with_context(|| format!("failed to spawn worker {t}"))?;
            workers.push(handle);
        }

        let flusher =
            stopped.spawn_flusher(Arc::clone(&quitting), STOPPED_FLUSH_INTERVAL);

        Ok(Self {
            config,
            queues,
            stats,
            stopped,
            quitting,
            workers,
            flusher: Some(flusher),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stopped(&self) -> &Arc<StoppedSet> {
        &self.stopped
    }

    pub fn packet_threads(&self) -> u16 {
        self.config.packet_threads
    }

    /// The worker owning flows with this id.
    pub fn thread_for(&self, id: &SessionId) -> u16 {
        id.thread_for(self.config.packet_threads)
    }

    /// Enqueues deferred work on a worker. Returns false for an out-of-range
    /// thread.
    pub fn dispatch(&self, thread: u16, cmd: Command) -> bool {
        match self.queues.get(thread as usize) {
            Some(queue) => {
                queue.push(cmd);
                true
            },
            None => false,
        }
    }

    /// Total commands not yet consumed, waking any worker that still has
    /// some.
    pub fn command_outstanding(&self) -> usize {
        let mut count = 0;
        for queue in &self.queues {
            let len = queue.len();
            if len > 0 {
                queue.nudge();
            }
            count += len;
        }
        count
    }

    /// Sessions parked on closing queues across all workers.
    pub fn close_outstanding(&self) -> u32 {
        self.stats.iter().map(|s| s.closing()).sum()
    }

    /// Finalized sessions whose save is deferred on outstanding queries.
    pub fn need_save_outstanding(&self) -> u32 {
        self.stats.iter().map(|s| s.need_save()).sum()
    }

    /// Sessions currently keyed in any hash table.
    pub fn monitoring_count(&self) -> u32 {
        self.stats.iter().map(|s| s.hashed_total()).sum()
    }

    /// Sessions on the active queues of one L4 kind.
    pub fn watch_count(&self, kind: L4Kind) -> u32 {
        self.stats.iter().map(|s| s.active(kind)).sum()
    }

    /// How far past its idle deadline the oldest session of `kind` is, in
    /// seconds; 0 when nothing is overdue.
    pub fn idle_seconds(&self, kind: L4Kind) -> i64 {
        let timeout = i64::from(self.config.timeouts.get(kind));
        let mut idle = 0i64;
        for stat in &self.stats {
            let Some(head) = stat.head_last_packet(kind) else {
                continue;
            };
            let tmp = stat.last_packet_secs() as i64 - (head as i64 + timeout);
            if tmp > idle {
                idle = tmp;
            }
        }
        idle
    }

    /// Asks every worker to finalize all of its sessions.
    pub fn flush(&self) {
        for queue in &self.queues {
            queue.push(Command::for_thread(Worker::flush_close));
        }
    }

    /// Flush, wait for the outstanding counters to drain, then stop the
    /// threads. Bounded by a drain cap so a sink that never completes its
    /// queries cannot wedge shutdown forever.
    pub fn shutdown(&mut self) {
        self.flush();
        let deadline = Instant::now() + SHUTDOWN_DRAIN_CAP;
        loop {
            let commands = self.command_outstanding();
            let closing = self.close_outstanding();
            let need_save = self.need_save_outstanding();
            if commands == 0 && closing == 0 && need_save == 0 {
                break;
            }
            if Instant::now() > deadline {
                warn!(
                    commands,
                    closing, need_save, "shutdown drain cap hit; tearing down"
                );
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        info!(sessions = self.monitoring_count(), "session engine stopping");
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.quitting.store(true, Ordering::Relaxed);
        for queue in &self.queues {
            queue.nudge();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
