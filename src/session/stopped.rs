// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persisted stopped-sessions side table.
//!
//! Remembers across process restarts that a flow was marked "stop SPI"
//! and/or "truncated pcap", so a reappearing flow resumes the marking. Two
//! generations: `old` is loaded once at startup and consulted on session
//! creation; `new` accumulates the currently-live marked sessions. A
//! periodic flusher drops `old` on its first fire and rewrites the on-disk
//! file on every fire.
//!
//! File layout (little endian):
//!
//! ```text
//! u32 version (= 1) | u32 count | count * ( id bytes | u32 flags )
//! ```
//!
//! where each id record is the session id's own length-prefixed encoding.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use bitflags::bitflags;
use dashmap::DashMap;
use tracing::{debug, error, warn};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32,
};

use crate::session::id::{SESSION_ID_V4_LEN, SESSION_ID_V6_LEN, SessionId};

pub const STOPPED_FILE_VERSION: u32 = 1;

bitflags! {
    /// Per-id persisted marking.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct StoppedFlags: u32 {
        /// Stop generating SPI data for this flow.
        const SPI  = 0x01;
        /// Stop writing packet payload (truncated pcap).
        const PCAP = 0x02;
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct StoppedFileHeader {
    version: U32<LittleEndian>,
    count: U32<LittleEndian>,
}

pub struct StoppedSet {
    path: PathBuf,
    /// Read-only after load; dropped on the flusher's first fire.
    old: Mutex<Option<HashMap<SessionId, StoppedFlags>>>,
    /// Markings of currently-live sessions.
    new: DashMap<SessionId, StoppedFlags>,
}

impl StoppedSet {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            old: Mutex::new(None),
            new: DashMap::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Populates the `old` generation from disk. Corruption and unknown
    /// versions are reported and leave the set empty; the service keeps
    /// running either way.
    pub fn load(&self) {
        if !self.path.exists() {
            return;
        }
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) => {
                error!(path = %self.path.display(), error = %e,
                    "couldn't open stopped-sessions file");
                return;
            },
        };
        let Ok((header, mut rest)) = StoppedFileHeader::read_from_prefix(&data)
        else {
            error!(path = %self.path.display(), "stopped-sessions file corrupt");
            return;
        };
        if header.version.get() != STOPPED_FILE_VERSION {
            error!(
                path = %self.path.display(),
                version = header.version.get(),
                "unknown stopped-sessions file version"
            );
            return;
        }

        let mut map = HashMap::new();
        for _ in 0..header.count.get() {
            let Some(&len_byte) = rest.first() else {
                warn!(path = %self.path.display(), "stopped-sessions file truncated");
                break;
            };
            let len = len_byte as usize;
            if (len != SESSION_ID_V4_LEN && len != SESSION_ID_V6_LEN)
                || rest.len() < len + 4
            {
                warn!(path = %self.path.display(), "stopped-sessions file corrupt");
                break;
            }
            let Some(id) = SessionId::from_slice(&rest[..len]) else {
                warn!(path = %self.path.display(), "stopped-sessions file corrupt");
                break;
            };
            let flags = u32::from_le_bytes([
                rest[len],
                rest[len + 1],
                rest[len + 2],
                rest[len + 3],
            ]);
            map.insert(id, StoppedFlags::from_bits_truncate(flags));
            rest = &rest[len + 4..];
        }

        debug!(count = map.len(), "loaded stopped sessions");
        *self.old.lock().unwrap_or_else(PoisonError::into_inner) = Some(map);
    }

    /// Prior-run marking for `id`, empty once `old` has been dropped.
    pub fn restore(&self, id: &SessionId) -> StoppedFlags {
        self.old
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|m| m.get(id).copied())
            .unwrap_or_default()
    }

    /// Sets or clears the SPI bit for `id` in the `new` generation. Returns
    /// whether the id is still present afterwards.
    pub fn set_spi(&self, id: &SessionId, value: bool) -> bool {
        if value {
            self.new.entry(*id).or_default().insert(StoppedFlags::SPI);
            return true;
        }
        let now_empty = match self.new.get_mut(id) {
            Some(mut e) => {
                e.remove(StoppedFlags::SPI);
                e.is_empty()
            },
            None => return false,
        };
        if now_empty {
            self.new.remove(id);
            return false;
        }
        true
    }

    /// Marks `id` truncated-pcap in the `new` generation.
    pub fn set_pcap(&self, id: &SessionId) {
        self.new.entry(*id).or_default().insert(StoppedFlags::PCAP);
    }

    /// Forgets a live marking (called when the marked session finalizes).
    pub fn forget(&self, id: &SessionId) {
        self.new.remove(id);
    }

    pub fn new_len(&self) -> usize {
        self.new.len()
    }

    /// Drops the startup generation. Later `restore` calls see nothing.
    pub fn drop_old(&self) {
        *self.old.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Atomically rewrites the on-disk file from the `new` generation.
    pub fn write(&self) -> Result<u32> {
        let mut body = Vec::new();
        let mut count = 0u32;
        for item in self.new.iter() {
            body.extend_from_slice(item.key().as_bytes());
            body.extend_from_slice(&item.value().bits().to_le_bytes());
            count += 1;
        }

        let header = StoppedFileHeader {
            version: U32::new(STOPPED_FILE_VERSION),
            count: U32::new(count),
        };
        let mut data = Vec::with_capacity(8 + body.len());
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(&body);

        let tmp = self.path.with_extension("stoppedsessions.tmp");
        fs::write(&tmp, &data).with_context(|| {
            format!("couldn't write stopped-sessions file {:?}", tmp)
        })?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("couldn't replace stopped-sessions file {:?}", self.path)
        })?;
        Ok(count)
    }

    /// Background flusher: every `interval` drops `old` (first fire only)
    /// and rewrites the file. Quitting skips the final update because
    /// in-flight sessions may still be present.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        quitting: Arc<AtomicBool>,
        interval: Duration,
    ) -> thread::JoinHandle<()> {
        let set = Arc::clone(self);
        thread::Builder::new()
            .name("flowcap-stopped".to_string())
            .spawn(move || {
                let step = Duration::from_millis(100);
                let mut first = true;
                'outer: loop {
                    let mut slept = Duration::ZERO;
                    while slept < interval {
                        if quitting.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        thread::sleep(step);
                        slept += step;
                    }
                    if quitting.load(Ordering::Relaxed) {
                        break;
                    }
                    if first {
                        set.drop_old();
                        first = false;
                    }
                    match set.write() {
                        Ok(count) => debug!(count, "saved stopped sessions"),
                        Err(e) => error!(error = %e, "stopped-sessions save failed"),
                    }
                }
            })
            .expect("failed to spawn stopped-sessions flusher")
    }
}
