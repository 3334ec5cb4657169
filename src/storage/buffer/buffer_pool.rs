// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Residency budget and second-chance eviction.
//!
//! Responsibilities:
//! - Accounts resident page bytes against a fixed budget.
//! - Runs the eviction queue: entries remember the frame version they were
//!   queued at, so a CAS against that version can never victimize a page
//!   that was reused in between.
//! - Brings evicted pages back through the `Loading` state, reading them
//!   from the frame store.
//!
//! Key exported interfaces:
//! - Types: `BufferPool`, `FrameStore`, `FileFrameStore`.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::NodeId;
use crate::storage::buffer::frame::{Frame, FrameState};
use crate::storage::buffer::page_id::{PageId, PageSizeClass};
use crate::storage::buffer::volatile_region::VolatileRegion;
use crate::storage::buffer::BufferError;

/// Synchronous disk side of a frame. Pages of one size class live at
/// `index * class_bytes` offsets of a per-class backing object.
pub trait FrameStore: Send + Sync {
    fn read_from_disk(&self, page_id: PageId, buffer: &mut [u8]) -> std::io::Result<()>;
    fn write_to_disk(&self, page_id: PageId, buffer: &[u8]) -> std::io::Result<()>;
}

/// Default store: one lazily created swap file per size class.
pub struct FileFrameStore {
    dir: PathBuf,
    files: [Mutex<Option<File>>; PageSizeClass::COUNT],
}

impl FileFrameStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: std::array::from_fn(|_| Mutex::new(None)),
        })
    }

    fn with_file<R>(
        &self,
        size_class: PageSizeClass,
        op: impl FnOnce(&mut File) -> std::io::Result<R>,
    ) -> std::io::Result<R> {
        let mut slot = self.files[size_class.index()]
            .lock()
            .expect("frame store file lock");
        if slot.is_none() {
            let path = self.dir.join(format!("class-{}.swap", size_class));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            *slot = Some(file);
        }
        op(slot.as_mut().expect("frame store file opened"))
    }
}

impl FrameStore for FileFrameStore {
    fn read_from_disk(&self, page_id: PageId, buffer: &mut [u8]) -> std::io::Result<()> {
        self.with_file(page_id.size_class(), |file| {
            // Never-written tails of the swap file read back as zeros.
            buffer.fill(0);
            file.seek(SeekFrom::Start(
                page_id.index() * page_id.num_bytes() as u64,
            ))?;
            let mut filled = 0;
            while filled < buffer.len() {
                match file.read(&mut buffer[filled..])? {
                    0 => break,
                    n => filled += n,
                }
            }
            Ok(())
        })
    }

    fn write_to_disk(&self, page_id: PageId, buffer: &[u8]) -> std::io::Result<()> {
        self.with_file(page_id.size_class(), |file| {
            file.seek(SeekFrom::Start(
                page_id.index() * page_id.num_bytes() as u64,
            ))?;
            file.write_all(buffer)
        })
    }
}

#[derive(Copy, Clone, Debug)]
struct EvictionItem {
    page_id: PageId,
    version: u64,
}

/// Byte budget plus the second-chance queue of eviction candidates.
pub struct BufferPool {
    budget_bytes: u64,
    used_bytes: AtomicU64,
    eviction_queue: Mutex<VecDeque<EvictionItem>>,
    regions: Vec<Option<Arc<VolatileRegion>>>,
    store: Arc<dyn FrameStore>,
    node_id: NodeId,
}

impl BufferPool {
    pub fn new(
        budget_bytes: u64,
        regions: Vec<Option<Arc<VolatileRegion>>>,
        store: Arc<dyn FrameStore>,
        node_id: NodeId,
    ) -> Self {
        Self {
            budget_bytes,
            used_bytes: AtomicU64::new(0),
            eviction_queue: Mutex::new(VecDeque::new()),
            regions,
            store,
            node_id,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Bytes currently charged against the budget.
    pub fn resident_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn eviction_queue_len(&self) -> usize {
        self.eviction_queue
            .lock()
            .expect("eviction queue lock")
            .len()
    }

    fn region(&self, size_class: PageSizeClass) -> &Arc<VolatileRegion> {
        self.regions[size_class.index()]
            .as_ref()
            .expect("size class has a region")
    }

    /// Reserve `bytes` of residency budget, evicting queued victims until
    /// the reservation fits. Fails once the queue is exhausted.
    pub fn ensure_free_pages(&self, bytes: u64) -> Result<(), BufferError> {
        loop {
            if self.try_reserve(bytes) {
                return Ok(());
            }
            if !self.evict_one()? {
                return Err(BufferError::OutOfBudget { need: bytes });
            }
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        let mut used = self.used_bytes.load(Ordering::Acquire);
        loop {
            if used + bytes > self.budget_bytes {
                return false;
            }
            match self.used_bytes.compare_exchange(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    pub(crate) fn release_bytes(&self, bytes: u64) {
        let previous = self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "buffer pool byte accounting underflow");
    }

    /// Queue the page as an eviction candidate at its current version.
    /// Stale entries (the version moved on) are dropped when popped, which
    /// also bounds duplicates per residency episode.
    pub fn add_to_eviction_queue(&self, page_id: PageId) {
        let version = Frame::version(self.region(page_id.size_class()).frame(page_id).state_and_version());
        self.eviction_queue
            .lock()
            .expect("eviction queue lock")
            .push_back(EvictionItem { page_id, version });
    }

    /// Process one eviction-queue entry. Returns false when the queue is
    /// empty, true when an entry was consumed (freed, re-queued for its
    /// second chance, or dropped as stale).
    fn evict_one(&self) -> Result<bool, BufferError> {
        let item = {
            let mut queue = self.eviction_queue.lock().expect("eviction queue lock");
            match queue.pop_front() {
                Some(item) => item,
                None => return Ok(false),
            }
        };

        let region = self.region(item.page_id.size_class());
        let frame = region.frame(item.page_id);
        let sv = frame.state_and_version();
        if Frame::version(sv) != item.version {
            // The page was reused since it was queued.
            return Ok(true);
        }

        match Frame::state(sv) {
            FrameState::Resident => {
                // Second chance: mark and revisit.
                if frame.try_mark(sv) {
                    self.eviction_queue
                        .lock()
                        .expect("eviction queue lock")
                        .push_back(item);
                }
                Ok(true)
            }
            FrameState::Marked => {
                if !frame.try_lock_exclusive(sv) {
                    return Ok(true);
                }
                if Frame::is_dirty(frame.state_and_version()) {
                    let bytes = unsafe { region.page_slice(item.page_id) };
                    if let Err(err) = self.store.write_to_disk(item.page_id, bytes) {
                        // Keep the page resident and reclaimable.
                        frame.unlock_exclusive();
                        self.add_to_eviction_queue(item.page_id);
                        return Err(BufferError::Io(err));
                    }
                    frame.set_dirty(false);
                }
                frame.unlock_exclusive_and_evict();
                region.protect_page(item.page_id);
                self.release_bytes(item.page_id.num_bytes() as u64);
                Ok(true)
            }
            // Locked, loading or already evicted: someone else owns the
            // transition.
            _ => Ok(true),
        }
    }

    /// Bring an evicted page back to residency, reading its contents from
    /// the frame store. Resident pages return immediately.
    pub fn make_resident(&self, page_id: PageId) -> Result<(), BufferError> {
        let region = self.region(page_id.size_class());
        let frame = region.frame(page_id);
        loop {
            let sv = frame.state_and_version();
            match Frame::state(sv) {
                FrameState::Resident
                | FrameState::Marked
                | FrameState::LockedShared(_)
                | FrameState::LockedExclusive => return Ok(()),
                FrameState::Loading => {
                    // Another thread is loading this page; wait it out.
                    std::thread::yield_now();
                    continue;
                }
                FrameState::Evicted => {
                    if !frame.try_start_loading(sv) {
                        continue;
                    }
                    if let Err(err) = self.ensure_free_pages(page_id.num_bytes() as u64) {
                        frame.abort_loading();
                        return Err(err);
                    }
                    region.unprotect_page(page_id);
                    let buffer = unsafe { region.page_slice_mut(page_id) };
                    if let Err(err) = self.store.read_from_disk(page_id, buffer) {
                        region.protect_page(page_id);
                        self.release_bytes(page_id.num_bytes() as u64);
                        frame.abort_loading();
                        return Err(BufferError::Io(err));
                    }
                    frame.finish_loading();
                    self.add_to_eviction_queue(page_id);
                    return Ok(());
                }
            }
        }
    }
}
