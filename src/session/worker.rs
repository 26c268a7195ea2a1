// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-thread session owner.
//!
//! Each packet thread owns one `Worker`: the arena holding its sessions, one
//! hash table and one active queue per L4 kind, the closing queue, and the
//! TCP write queue. All session mutation happens on the owning thread; other
//! threads reach in only through the command queue.
//!
//! The tick runs four phases in a fixed order: queued commands, the closing
//! queue, idle/capacity eviction per kind, and TCP checkpoint saves. Each
//! phase is bounded so a busy worker keeps draining packets between ticks.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use tracing::debug;

use crate::{
    cfg::config::Config,
    db::SessionSink,
    session::{
        arena::{HandleList, LinkRole, SessionArena, SessionHandle},
        commands::{Command, CommandQueue},
        entry::{
            L4_KIND_COUNT, L4Kind, RootId, SessionEntry, SessionFlags,
            TCP_FLAG_COUNT,
        },
        id::SessionId,
        protocols::{self, ProtocolId},
        stopped::{StoppedFlags, StoppedSet},
        table::SessionHashTable,
    },
};

const TICK_COMMAND_LIMIT: usize = 50;
const TICK_CLOSING_LIMIT: usize = 10;
const TICK_IDLE_LIMIT: usize = 10;
const TICK_MID_SAVE_LIMIT: usize = 50;

/// Sentinel stored in the head-age slots when a queue is empty.
const NO_HEAD: u64 = u64::MAX;

/// Cross-thread view of one worker's load, kept current by the owner.
pub struct WorkerStats {
    hashed: [AtomicU32; L4_KIND_COUNT],
    active: [AtomicU32; L4_KIND_COUNT],
    head_last_packet: [AtomicU64; L4_KIND_COUNT],
    closing: AtomicU32,
    need_save: AtomicU32,
    last_packet_secs: AtomicU64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            hashed: std::array::from_fn(|_| AtomicU32::new(0)),
            active: std::array::from_fn(|_| AtomicU32::new(0)),
            head_last_packet: std::array::from_fn(|_| AtomicU64::new(NO_HEAD)),
            closing: AtomicU32::new(0),
            need_save: AtomicU32::new(0),
            last_packet_secs: AtomicU64::new(0),
        }
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hashed_total(&self) -> u32 {
        self.hashed.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn active(&self, kind: L4Kind) -> u32 {
        self.active[kind.index()].load(Ordering::Relaxed)
    }

    pub fn closing(&self) -> u32 {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn need_save(&self) -> u32 {
        self.need_save.load(Ordering::Relaxed)
    }

    pub fn head_last_packet(&self, kind: L4Kind) -> Option<u64> {
        match self.head_last_packet[kind.index()].load(Ordering::Relaxed) {
            NO_HEAD => None,
            sec => Some(sec),
        }
    }

    pub fn last_packet_secs(&self) -> u64 {
        self.last_packet_secs.load(Ordering::Relaxed)
    }
}

pub type SaveHook = Box<dyn Fn(&mut SessionEntry, bool) + Send + Sync>;

/// External save-path participants: plugin pre-save callbacks run before the
/// outstanding-query check, rule-engine callbacks run right before the sink.
#[derive(Default)]
pub struct SaveHooks {
    pub pre_save: Vec<SaveHook>,
    pub before_save: Vec<SaveHook>,
}

pub struct Worker {
    thread: u16,
    config: Arc<Config>,
    sink: Arc<dyn SessionSink>,
    stopped: Arc<StoppedSet>,
    commands: Arc<CommandQueue>,
    stats: Arc<WorkerStats>,
    hooks: Arc<SaveHooks>,

    arena: SessionArena,
    tables: [SessionHashTable; L4_KIND_COUNT],
    active: [HandleList; L4_KIND_COUNT],
    closing: HandleList,
    tcp_write: HandleList,

    last_packet_secs: u64,
    need_save: u32,
}

impl Worker {
    pub fn new(
        thread: u16,
        config: Arc<Config>,
        sink: Arc<dyn SessionSink>,
        stopped: Arc<StoppedSet>,
        commands: Arc<CommandQueue>,
        stats: Arc<WorkerStats>,
        hooks: Arc<SaveHooks>,
    ) -> Self {
        let tables =
            L4Kind::ALL.map(|k| SessionHashTable::new(config.max_streams.get(k)));
        Self {
            thread,
            config,
            sink,
            stopped,
            commands,
            stats,
            hooks,
            arena: SessionArena::new(),
            tables,
            active: [HandleList::default(); L4_KIND_COUNT],
            closing: HandleList::default(),
            tcp_write: HandleList::default(),
            last_packet_secs: 0,
            need_save: 0,
        }
    }

    pub fn thread(&self) -> u16 {
        self.thread
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stopped(&self) -> &Arc<StoppedSet> {
        &self.stopped
    }

    pub fn command_queue(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&SessionEntry> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut SessionEntry> {
        self.arena.get_mut(handle)
    }

    pub fn session_count(&self, kind: L4Kind) -> u32 {
        self.tables[kind.index()].count()
    }

    pub fn active_len(&self, kind: L4Kind) -> u32 {
        self.active[kind.index()].len()
    }

    pub fn closing_len(&self) -> u32 {
        self.closing.len()
    }

    pub fn tcp_write_len(&self) -> u32 {
        self.tcp_write.len()
    }

    pub fn need_save_count(&self) -> u32 {
        self.need_save
    }

    pub fn last_packet_secs(&self) -> u64 {
        self.last_packet_secs
    }

    /// Advances this thread's packet clock. Eviction deadlines are measured
    /// against this, not wall time.
    pub fn set_last_packet_secs(&mut self, secs: u64) {
        self.last_packet_secs = secs;
        self.stats.last_packet_secs.store(secs, Ordering::Relaxed);
    }

    /// Head-to-tail snapshot of an active queue, oldest first.
    pub fn active_handles(&self, kind: L4Kind) -> Vec<SessionHandle> {
        let list = &self.active[kind.index()];
        let mut out = Vec::with_capacity(list.len() as usize);
        let mut cursor = list.head();
        while let Some(h) = cursor {
            out.push(h);
            cursor = list.next_of(&self.arena, LinkRole::Queue, h);
        }
        out
    }

    /// Read-only lookup on the owner thread.
    pub fn find(&self, kind: L4Kind, id: &SessionId) -> Option<SessionHandle> {
        self.tables[kind.index()].find(&self.arena, id.hash32(), id)
    }

    /// Returns the session for `id`, creating it if absent. An existing
    /// session not yet closing is touched to the tail of its active queue.
    /// New sessions inherit any stop marking recorded by a prior run.
    /// Pass `hash == 0` to have the id hashed here.
    pub fn find_or_create(
        &mut self,
        protocol: ProtocolId,
        hash: u32,
        id: &SessionId,
    ) -> (SessionHandle, bool) {
        let hash = if hash == 0 { id.hash32() } else { hash };
        let kind = protocols::kind_of(protocol);
        let ki = kind.index();

        if let Some(handle) = self.tables[ki].find(&self.arena, hash, id) {
            let closing = self
                .arena
                .get(handle)
                .map(|e| e.flags.contains(SessionFlags::CLOSING_QUEUED))
                .unwrap_or(false);
            if !closing {
                self.active[ki].move_tail(&mut self.arena, LinkRole::Queue, handle);
                self.refresh_head_stat(kind);
            }
            return (handle, false);
        }

        let mut entry = SessionEntry::new(
            *id,
            hash,
            self.thread,
            kind,
            protocol,
            self.config.enable_packet_len,
        );
        let restored = self.stopped.restore(id);
        if restored.contains(StoppedFlags::SPI) {
            entry.flags.insert(SessionFlags::STOP_SPI);
        }
        if restored.contains(StoppedFlags::PCAP) {
            entry.stop_saving = 0;
        }

        let handle = self.arena.insert(entry);
        self.tables[ki].insert(&mut self.arena, handle, self.thread, kind);
        self.active[ki].push_tail(&mut self.arena, LinkRole::Queue, handle);
        self.stats.hashed[ki].fetch_add(1, Ordering::Relaxed);
        self.stats.active[ki].fetch_add(1, Ordering::Relaxed);
        self.refresh_head_stat(kind);
        (handle, true)
    }

    /// Moves a flow onto the closing queue with
    /// `save_time = last_packet + tcpClosingTimeout` and unhooks it from the
    /// TCP write queue. Idempotent.
    pub fn mark_for_close(&mut self, handle: SessionHandle) {
        let closing_timeout = u64::from(self.config.tcp_closing_timeout);
        let (kind, tcp_queued) = {
            let Some(entry) = self.arena.get_mut(handle) else { return };
            if entry.flags.contains(SessionFlags::CLOSING_QUEUED) {
                return;
            }
            entry.flags.insert(SessionFlags::CLOSING_QUEUED);
            entry.save_time = entry.last_packet.sec + closing_timeout;
            (entry.kind, entry.flags.contains(SessionFlags::TCP_QUEUED))
        };
        let ki = kind.index();
        self.active[ki].remove(&mut self.arena, LinkRole::Queue, handle);
        self.stats.active[ki].fetch_sub(1, Ordering::Relaxed);
        self.closing.push_tail(&mut self.arena, LinkRole::Queue, handle);
        self.stats.closing.fetch_add(1, Ordering::Relaxed);
        if tcp_queued {
            self.tcp_write.remove(&mut self.arena, LinkRole::Tcp, handle);
            if let Some(entry) = self.arena.get_mut(handle) {
                entry.flags.remove(SessionFlags::TCP_QUEUED);
            }
        }
        self.refresh_head_stat(kind);
    }

    /// Hooks a TCP session onto the write queue so the tick schedules
    /// periodic checkpoint saves for it.
    pub fn enqueue_tcp_write(&mut self, handle: SessionHandle) {
        let save_timeout = u64::from(self.config.tcp_save_timeout);
        {
            let Some(entry) = self.arena.get_mut(handle) else { return };
            if entry.kind != L4Kind::Tcp
                || entry.flags.contains(SessionFlags::TCP_QUEUED)
                || entry.flags.contains(SessionFlags::CLOSING_QUEUED)
            {
                return;
            }
            entry.flags.insert(SessionFlags::TCP_QUEUED);
            entry.save_time = entry.last_packet.sec + save_timeout;
        }
        self.tcp_write.push_tail(&mut self.arena, LinkRole::Tcp, handle);
    }

    /// Finalizes a session: unlinks it everywhere, runs parser and plugin
    /// save callbacks, and either saves and frees it or defers on
    /// outstanding queries (`decrement_outstanding` completes the save
    /// later).
    pub fn save(&mut self, handle: SessionHandle) {
        let Some(entry) = self.arena.get(handle) else { return };
        let kind = entry.kind;
        let flags = entry.flags;
        let ki = kind.index();

        // Already finalized and parked on an outstanding query.
        if flags.contains(SessionFlags::NEEDS_SAVE) {
            return;
        }

        if flags.contains(SessionFlags::IN_HASH) {
            self.tables[ki].remove(&mut self.arena, handle);
            self.stats.hashed[ki].fetch_sub(1, Ordering::Relaxed);
        }
        if flags.contains(SessionFlags::CLOSING_QUEUED) {
            self.closing.remove(&mut self.arena, LinkRole::Queue, handle);
            self.stats.closing.fetch_sub(1, Ordering::Relaxed);
            if let Some(entry) = self.arena.get_mut(handle) {
                entry.flags.remove(SessionFlags::CLOSING_QUEUED);
            }
        } else {
            self.active[ki].remove(&mut self.arena, LinkRole::Queue, handle);
            self.stats.active[ki].fetch_sub(1, Ordering::Relaxed);
            self.refresh_head_stat(kind);
        }
        if flags.contains(SessionFlags::TCP_QUEUED) {
            self.tcp_write.remove(&mut self.arena, LinkRole::Tcp, handle);
        }

        let hooks = Arc::clone(&self.hooks);
        let sink = Arc::clone(&self.sink);
        let deferred = {
            let entry = self
                .arena
                .get_mut(handle)
                .expect("session vanished during save");
            entry.flags.remove(SessionFlags::TCP_QUEUED);
            entry.tcp_segments.clear();

            let mut parsers = std::mem::take(&mut entry.parsers);
            for parser in &mut parsers {
                parser.on_save(&mut entry.fields, true);
            }
            entry.parsers = parsers;

            for hook in &hooks.pre_save {
                hook(entry, true);
            }

            if entry.outstanding_queries > 0 {
                entry.flags.insert(SessionFlags::NEEDS_SAVE);
                true
            } else {
                for hook in &hooks.before_save {
                    hook(entry, true);
                }
                sink.save(entry, true);
                false
            }
        };

        if deferred {
            self.need_save += 1;
            self.stats.need_save.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.free_session(handle);
    }

    /// Checkpoint save: flushes the session to the sink, resets the
    /// accumulated counters and file offsets, and re-queues it at the tail
    /// of the TCP write queue. The session stays resident.
    pub fn mid_save(&mut self, handle: SessionHandle, tv_sec: u64) {
        let hooks = Arc::clone(&self.hooks);
        let sink = Arc::clone(&self.sink);
        let save_timeout = u64::from(self.config.tcp_save_timeout);
        let tcp_queued = {
            let Some(entry) = self.arena.get_mut(handle) else { return };

            let mut parsers = std::mem::take(&mut entry.parsers);
            for parser in &mut parsers {
                parser.on_save(&mut entry.fields, false);
            }
            entry.parsers = parsers;

            for hook in &hooks.pre_save {
                hook(entry, false);
            }
            if entry.root_id == RootId::None {
                entry.root_id = RootId::Own;
            }
            for hook in &hooks.before_save {
                hook(entry, false);
            }
            sink.save(entry, false);

            entry.file_positions.clear();
            if let Some(lens) = entry.file_lengths.as_mut() {
                lens.clear();
            }
            entry.file_numbers.clear();
            entry.last_file_num = 0;

            // A closing session keeps its closing deadline.
            if !entry.flags.contains(SessionFlags::CLOSING_QUEUED) {
                entry.save_time = tv_sec + save_timeout;
            }
            entry.bytes = [0; 2];
            entry.data_bytes = [0; 2];
            entry.packets = [0; 2];
            entry.flags.remove(SessionFlags::MID_SAVE);
            entry.ack_time = 0;
            entry.syn_time = 0;
            entry.tcp_flag_counts = [0; TCP_FLAG_COUNT];
            entry.flags.contains(SessionFlags::TCP_QUEUED)
        };
        if tcp_queued {
            self.tcp_write.move_tail(&mut self.arena, LinkRole::Tcp, handle);
        }
    }

    /// Completion callback for an asynchronous enrichment. If finalization
    /// already ran, the deferred save fires exactly once and the session is
    /// freed; returns false in that case.
    pub fn decrement_outstanding(&mut self, handle: SessionHandle) -> bool {
        let hooks = Arc::clone(&self.hooks);
        let sink = Arc::clone(&self.sink);
        let freed = {
            let Some(entry) = self.arena.get_mut(handle) else {
                return false;
            };
            entry.outstanding_queries = entry.outstanding_queries.saturating_sub(1);
            if entry.flags.contains(SessionFlags::NEEDS_SAVE)
                && entry.outstanding_queries == 0
            {
                // Clear first so hooks adding tags can't re-enter the save.
                entry.flags.remove(SessionFlags::NEEDS_SAVE);
                for hook in &hooks.before_save {
                    hook(entry, true);
                }
                sink.save(entry, true);
                true
            } else {
                false
            }
        };
        if freed {
            self.need_save -= 1;
            self.stats.need_save.fetch_sub(1, Ordering::Relaxed);
            self.free_session(handle);
            return false;
        }
        true
    }

    /// Marks/unmarks the flow "stop SPI", mirroring the state into the
    /// stopped-set `new` generation so a restart can restore it.
    pub fn set_stop_spi(&mut self, handle: SessionHandle, value: bool) {
        let id = {
            let Some(entry) = self.arena.get_mut(handle) else { return };
            entry.flags.set(SessionFlags::STOP_SPI, value);
            entry.session_id
        };
        let present = self.stopped.set_spi(&id, value);
        if let Some(entry) = self.arena.get_mut(handle) {
            entry.flags.set(SessionFlags::IN_STOPPED_SAVE, present);
        }
    }

    /// Stops pcap payload capture for the flow: tags `truncated-pcap` and
    /// records the marking for restarts.
    pub fn set_stop_saving(&mut self, handle: SessionHandle) {
        let id = {
            let Some(entry) = self.arena.get_mut(handle) else { return };
            entry.add_tag("truncated-pcap");
            entry.stop_saving = 0;
            entry.session_id
        };
        self.stopped.set_pcap(&id);
        if let Some(entry) = self.arena.get_mut(handle) {
            entry.flags.insert(SessionFlags::IN_STOPPED_SAVE);
        }
    }

    /// One scheduler tick: commands, closing drain, idle/capacity eviction,
    /// then TCP checkpoints, each phase bounded.
    pub fn tick(&mut self) {
        self.run_commands();
        self.drain_closing();
        self.evict_idle();
        self.tcp_checkpoints();
    }

    fn run_commands(&mut self) {
        let queue = Arc::clone(&self.commands);
        for _ in 0..TICK_COMMAND_LIMIT {
            let Some(cmd) = queue.pop() else { break };
            match cmd {
                Command::Session { target, func } => {
                    if self.arena.contains(target) {
                        func(self, target);
                    } else {
                        debug!(
                            thread = self.thread,
                            "dropping command for freed session"
                        );
                    }
                },
                Command::Thread { func } => func(self),
            }
        }
    }

    fn drain_closing(&mut self) {
        for _ in 0..TICK_CLOSING_LIMIT {
            let Some(head) = self.closing.head() else { break };
            let due = self
                .arena
                .get(head)
                .map(|e| e.save_time < self.last_packet_secs)
                .unwrap_or(false);
            if !due {
                break;
            }
            self.save(head);
        }
    }

    fn evict_idle(&mut self) {
        for kind in L4Kind::ALL {
            let ki = kind.index();
            let max_streams = self.config.max_streams.get(kind);
            let timeout = u64::from(self.config.timeouts.get(kind));
            for _ in 0..TICK_IDLE_LIMIT {
                let Some(head) = self.active[ki].head() else { break };
                let over_capacity = self.active[ki].len() > max_streams;
                let idle = self
                    .arena
                    .get(head)
                    .map(|e| e.last_packet.sec + timeout < self.last_packet_secs)
                    .unwrap_or(false);
                if !(over_capacity || idle) {
                    break;
                }
                self.save(head);
            }
            self.refresh_head_stat(kind);
        }
    }

    fn tcp_checkpoints(&mut self) {
        for _ in 0..TICK_MID_SAVE_LIMIT {
            let Some(head) = self.tcp_write.head() else { break };
            let due = self
                .arena
                .get(head)
                .map(|e| e.save_time < self.last_packet_secs)
                .unwrap_or(false);
            if !due {
                break;
            }
            self.mid_save(head, self.last_packet_secs);
        }
    }

    /// Finalizes every session owned by this worker, closing queue first.
    /// Driven by the shutdown flush command.
    pub fn flush_close(&mut self) {
        while let Some(head) = self.closing.head() {
            self.save(head);
        }
        for kind in L4Kind::ALL {
            while let Some(head) = self.active[kind.index()].head() {
                self.save(head);
            }
        }
    }

    fn free_session(&mut self, handle: SessionHandle) {
        let Some(entry) = self.arena.get(handle) else { return };
        let flags = entry.flags;
        let id = entry.session_id;
        if flags.contains(SessionFlags::TCP_QUEUED) {
            self.tcp_write.remove(&mut self.arena, LinkRole::Tcp, handle);
        }
        if flags.contains(SessionFlags::IN_STOPPED_SAVE) {
            self.stopped.forget(&id);
        }
        self.arena.remove(handle);
    }

    fn refresh_head_stat(&self, kind: L4Kind) {
        let sec = self.active[kind.index()]
            .head()
            .and_then(|h| self.arena.get(h))
            .map(|e| e.last_packet.sec)
            .unwrap_or(NO_HEAD);
        self.stats.head_last_packet[kind.index()].store(sec, Ordering::Relaxed);
    }
}
