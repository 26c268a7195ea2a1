// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cross-thread command queues.
//!
//! Every worker owns one multi-producer/single-consumer queue. Producers on
//! any thread push deferred work; the owning worker drains in arrival order
//! from its tick loop. Ordering is FIFO per producer only; there is no
//! cancellation and no priorities.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::session::{arena::SessionHandle, worker::Worker};

pub enum Command {
    /// Invoke a user function against one session. Dropped with a debug log
    /// if the session was freed before the command ran.
    Session {
        target: SessionHandle,
        func: Box<dyn FnOnce(&mut Worker, SessionHandle) + Send>,
    },
    /// Thread-scoped work carried without a session.
    Thread {
        func: Box<dyn FnOnce(&mut Worker) + Send>,
    },
}

impl Command {
    pub fn for_session(
        target: SessionHandle,
        func: impl FnOnce(&mut Worker, SessionHandle) + Send + 'static,
    ) -> Self {
        Command::Session {
            target,
            func: Box::new(func),
        }
    }

    pub fn for_thread(func: impl FnOnce(&mut Worker) + Send + 'static) -> Self {
        Command::Thread {
            func: Box::new(func),
        }
    }
}

#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<Command>>,
    wake: Condvar,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends and wakes the owning worker. Callable from any thread.
    pub fn push(&self, cmd: Command) {
        self.lock().push_back(cmd);
        self.wake.notify_one();
    }

    /// Owner-side dequeue in arrival order.
    pub fn pop(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Blocks the owner until work arrives or `timeout` elapses. Returns
    /// true when the queue is non-empty.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        if !guard.is_empty() {
            return true;
        }
        let (guard, _timed_out) = self
            .wake
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        !guard.is_empty()
    }

    /// Wakes the owner without queueing work (shutdown nudge).
    pub fn nudge(&self) {
        self.wake.notify_all();
    }
}
