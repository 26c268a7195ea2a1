// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Generational session arena.
//!
//! Sessions live in a per-worker arena addressed by `SessionHandle` (slot
//! index + generation). Hash chains and eviction queues link handles through
//! `Links` triples stored inside the entries, which keeps removal O(1)
//! without raw pointer aliasing. A handle whose generation no longer matches
//! resolves to `None`, so deferred commands against freed sessions are
//! harmless.

use crate::session::entry::{Links, SessionEntry};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn index(self) -> u32 {
        self.index
    }
}

enum Slot {
    Occupied {
        generation: u32,
        entry: Box<SessionEntry>,
    },
    Free {
        generation: u32,
        next_free: Option<u32>,
    },
}

#[derive(Default)]
pub struct SessionArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, entry: SessionEntry) -> SessionHandle {
        self.len += 1;
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let generation = match *slot {
                    Slot::Free {
                        generation,
                        next_free,
                    } => {
                        self.free_head = next_free;
                        generation
                    },
                    Slot::Occupied { .. } => {
                        unreachable!("free list points at an occupied slot")
                    },
                };
                *slot = Slot::Occupied {
                    generation,
                    entry: Box::new(entry),
                };
                SessionHandle { index, generation }
            },
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    entry: Box::new(entry),
                });
                SessionHandle {
                    index,
                    generation: 0,
                }
            },
        }
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<Box<SessionEntry>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next_gen = handle.generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Free {
                        generation: next_gen,
                        next_free: self.free_head,
                    },
                );
                self.free_head = Some(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { entry, .. } => Some(entry),
                    Slot::Free { .. } => None,
                }
            },
            _ => None,
        }
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&SessionEntry> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == handle.generation => {
                Some(entry)
            },
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut SessionEntry> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == handle.generation => {
                Some(entry)
            },
            _ => None,
        }
    }
}

/// Which of an entry's link triples a list threads through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkRole {
    Hash,
    Queue,
    Tcp,
}

fn links(entry: &SessionEntry, role: LinkRole) -> &Links {
    match role {
        LinkRole::Hash => &entry.hash_links,
        LinkRole::Queue => &entry.queue_links,
        LinkRole::Tcp => &entry.tcp_links,
    }
}

fn links_mut(entry: &mut SessionEntry, role: LinkRole) -> &mut Links {
    match role {
        LinkRole::Hash => &mut entry.hash_links,
        LinkRole::Queue => &mut entry.queue_links,
        LinkRole::Tcp => &mut entry.tcp_links,
    }
}

/// Intrusive doubly-linked list over arena handles. Tail pushes give LRU
/// ordering: least-recently-touched sessions sit at the head.
#[derive(Clone, Copy, Default, Debug)]
pub struct HandleList {
    head: Option<SessionHandle>,
    tail: Option<SessionHandle>,
    len: u32,
}

impl HandleList {
    pub fn head(&self) -> Option<SessionHandle> {
        self.head
    }

    pub fn tail(&self) -> Option<SessionHandle> {
        self.tail
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_tail(
        &mut self,
        arena: &mut SessionArena,
        role: LinkRole,
        handle: SessionHandle,
    ) {
        let old_tail = self.tail;
        {
            let entry = arena
                .get_mut(handle)
                .expect("pushing a stale handle onto a session list");
            let l = links_mut(entry, role);
            l.prev = old_tail;
            l.next = None;
        }
        match old_tail {
            Some(tail) => {
                let entry = arena
                    .get_mut(tail)
                    .expect("session list tail out of sync with arena");
                links_mut(entry, role).next = Some(handle);
            },
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    pub fn remove(
        &mut self,
        arena: &mut SessionArena,
        role: LinkRole,
        handle: SessionHandle,
    ) {
        let (prev, next) = {
            let entry = arena
                .get_mut(handle)
                .expect("removing a stale handle from a session list");
            let l = links_mut(entry, role);
            let pair = (l.prev, l.next);
            l.prev = None;
            l.next = None;
            pair
        };
        match prev {
            Some(p) => {
                let entry = arena
                    .get_mut(p)
                    .expect("session list prev link out of sync with arena");
                links_mut(entry, role).next = next;
            },
            None => self.head = next,
        }
        match next {
            Some(n) => {
                let entry = arena
                    .get_mut(n)
                    .expect("session list next link out of sync with arena");
                links_mut(entry, role).prev = prev;
            },
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub fn move_tail(
        &mut self,
        arena: &mut SessionArena,
        role: LinkRole,
        handle: SessionHandle,
    ) {
        if self.tail == Some(handle) {
            return;
        }
        self.remove(arena, role, handle);
        self.push_tail(arena, role, handle);
    }

    pub fn pop_head(
        &mut self,
        arena: &mut SessionArena,
        role: LinkRole,
    ) -> Option<SessionHandle> {
        let head = self.head?;
        self.remove(arena, role, head);
        Some(head)
    }

    /// Next handle after `handle` on this list, for read-only walks.
    pub fn next_of(
        &self,
        arena: &SessionArena,
        role: LinkRole,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        arena.get(handle).and_then(|e| links(e, role).next)
    }
}
