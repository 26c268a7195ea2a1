// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Closed-addressing session hash table.
//!
//! One table per (worker, L4 kind). Buckets hold the head of a chain
//! threaded through the entries' hash links. The bucket count is the
//! smallest prime at or above the configured per-kind stream limit and
//! never grows; long chains are reported, not refused.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::{
    session::{
        arena::{SessionArena, SessionHandle},
        entry::{L4Kind, SessionFlags},
        id::SessionId,
    },
    utils::next_prime,
};

/// Chain length past which an insert logs a complaint.
const CHAIN_WARN_LEN: u32 = 15;
/// Minimum seconds between chain complaints, process-wide.
const CHAIN_WARN_INTERVAL_SECS: u64 = 30;

static LAST_CHAIN_WARN: AtomicU64 = AtomicU64::new(0);

pub struct SessionHashTable {
    buckets: Vec<Option<SessionHandle>>,
    count: u32,
    max_streams: u32,
}

impl SessionHashTable {
    pub fn new(max_streams: u32) -> Self {
        let size = next_prime(max_streams) as usize;
        Self {
            buckets: vec![None; size],
            count: 0,
            max_streams,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, hash: u32) -> usize {
        (hash as usize) % self.buckets.len()
    }

    pub fn find(
        &self,
        arena: &SessionArena,
        hash: u32,
        id: &SessionId,
    ) -> Option<SessionHandle> {
        let mut cursor = self.buckets[self.bucket(hash)];
        while let Some(h) = cursor {
            let entry = arena.get(h)?;
            if entry.hash32 == hash && entry.session_id == *id {
                return Some(h);
            }
            cursor = entry.hash_links.next;
        }
        None
    }

    /// Links `handle` at the head of its chain. The caller guarantees the id
    /// is not already present.
    pub fn insert(
        &mut self,
        arena: &mut SessionArena,
        handle: SessionHandle,
        thread: u16,
        kind: L4Kind,
    ) {
        let (hash, id) = {
            let entry = arena
                .get_mut(handle)
                .expect("inserting a stale handle into the session table");
            (entry.hash32, entry.session_id)
        };
        let bucket = self.bucket(hash);
        let old_head = self.buckets[bucket];

        {
            let entry = arena
                .get_mut(handle)
                .expect("inserting a stale handle into the session table");
            entry.hash_links.prev = None;
            entry.hash_links.next = old_head;
            entry.flags.insert(SessionFlags::IN_HASH);
        }
        if let Some(head) = old_head {
            let entry = arena
                .get_mut(head)
                .expect("hash chain head out of sync with arena");
            entry.hash_links.prev = Some(handle);
        }
        self.buckets[bucket] = Some(handle);
        self.count += 1;

        let chain = self.chain_len(arena, bucket);
        if chain > CHAIN_WARN_LEN {
            self.warn_long_chain(&id, hash, bucket, thread, kind, chain);
        }
    }

    pub fn remove(&mut self, arena: &mut SessionArena, handle: SessionHandle) {
        let (hash, prev, next) = {
            let entry = arena
                .get_mut(handle)
                .expect("removing a stale handle from the session table");
            let links = entry.hash_links;
            entry.hash_links.prev = None;
            entry.hash_links.next = None;
            entry.flags.remove(SessionFlags::IN_HASH);
            (entry.hash32, links.prev, links.next)
        };
        match prev {
            Some(p) => {
                let entry = arena
                    .get_mut(p)
                    .expect("hash chain prev link out of sync with arena");
                entry.hash_links.next = next;
            },
            None => {
                let bucket = self.bucket(hash);
                self.buckets[bucket] = next;
            },
        }
        if let Some(n) = next {
            let entry = arena
                .get_mut(n)
                .expect("hash chain next link out of sync with arena");
            entry.hash_links.prev = prev;
        }
        self.count -= 1;
    }

    fn chain_len(&self, arena: &SessionArena, bucket: usize) -> u32 {
        let mut n = 0;
        let mut cursor = self.buckets[bucket];
        while let Some(h) = cursor {
            n += 1;
            cursor = arena.get(h).and_then(|e| e.hash_links.next);
        }
        n
    }

    fn warn_long_chain(
        &self,
        id: &SessionId,
        hash: u32,
        bucket: usize,
        thread: u16,
        kind: L4Kind,
        chain: u32,
    ) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let last = LAST_CHAIN_WARN.load(Ordering::Relaxed);
        if now.saturating_sub(last) <= CHAIN_WARN_INTERVAL_SECS {
            return;
        }
        if LAST_CHAIN_WARN
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        warn!(
            id = %id,
            hash,
            bucket,
            thread,
            kind = kind.name(),
            chain,
            size = self.size(),
            max_streams = self.max_streams,
            "large number of hash chains; consider raising maxStreams"
        );
    }
}
