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
//! Page-granular allocator over the volatile regions and the buffer pool.
//!
//! Responsibilities:
//! - Rounds requests up to the smallest enabled size class and issues page
//!   ids from a per-class free stack or a fresh index.
//! - Walks the allocation protocol: exclusive frame lock, unprotect,
//!   budget reservation with backoff, NUMA binding to the allocating
//!   worker's node, dirty publication and eviction-queue registration.
//! - Keeps relaxed-atomic allocation statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::ids::NodeId;
use crate::common::util::retry_with_backoff;
use crate::novarise_logging::warn;
use crate::scheduler::worker;
use crate::storage::buffer::buffer_pool::{BufferPool, FileFrameStore, FrameStore};
use crate::storage::buffer::frame::{Frame, FrameState};
use crate::storage::buffer::page_id::{PageId, PageSizeClass};
use crate::storage::buffer::volatile_region::VolatileRegion;
use crate::storage::buffer::BufferError;

/// Per-size-class book-keeping behind its own mutex so unrelated
/// allocations never serialize.
struct SizeClassState {
    free_page_ids: Vec<PageId>,
    next_index: u64,
}

pub struct PageAllocator {
    regions: Vec<Option<Arc<VolatileRegion>>>,
    pool: Arc<BufferPool>,
    class_states: Vec<Mutex<SizeClassState>>,
    num_allocs: AtomicU64,
    num_deallocs: AtomicU64,
    total_allocated_bytes: AtomicU64,
    numa_binding: bool,
}

impl PageAllocator {
    /// Build an allocator with the given budget and enabled size classes.
    /// Each enabled class gets a virtual reservation of four times the
    /// budget (at least 64 MiB, at most 8 GiB), so page indexes practically
    /// never run out before the budget does.
    pub fn new(
        budget_bytes: u64,
        enabled_classes: &[PageSizeClass],
        store: Arc<dyn FrameStore>,
        numa_binding: bool,
    ) -> Result<Self, BufferError> {
        let virtual_bytes = (budget_bytes.max(16 * 1024 * 1024) * 4)
            .min(8 * 1024 * 1024 * 1024) as usize;

        let mut regions: Vec<Option<Arc<VolatileRegion>>> =
            (0..PageSizeClass::COUNT).map(|_| None).collect();
        for class in enabled_classes {
            if regions[class.index()].is_none() {
                regions[class.index()] =
                    Some(Arc::new(VolatileRegion::new(*class, virtual_bytes)?));
            }
        }

        let pool = Arc::new(BufferPool::new(
            budget_bytes,
            regions.clone(),
            store,
            NodeId(0),
        ));
        let class_states = (0..PageSizeClass::COUNT)
            .map(|_| {
                Mutex::new(SizeClassState {
                    free_page_ids: Vec::new(),
                    next_index: 0,
                })
            })
            .collect();

        Ok(Self {
            regions,
            pool,
            class_states,
            num_allocs: AtomicU64::new(0),
            num_deallocs: AtomicU64::new(0),
            total_allocated_bytes: AtomicU64::new(0),
            numa_binding,
        })
    }

    /// Build from the loaded configuration with the file-backed store.
    pub fn new_from_config() -> Result<Self, BufferError> {
        let mut classes = Vec::new();
        for bytes in config::size_classes() {
            match PageSizeClass::from_bytes(bytes) {
                Some(class) => classes.push(class),
                None => warn!("ignoring unsupported size class of {} bytes", bytes),
            }
        }
        if classes.is_empty() {
            classes = PageSizeClass::ALL.to_vec();
        }
        let store = Arc::new(FileFrameStore::new(config::swap_dir())?);
        Self::new(
            config::buffer_pool_bytes(),
            &classes,
            store,
            config::enable_numa_binding(),
        )
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn region(&self, size_class: PageSizeClass) -> Option<&Arc<VolatileRegion>> {
        self.regions[size_class.index()].as_ref()
    }

    pub fn num_allocs(&self) -> u64 {
        self.num_allocs.load(Ordering::Relaxed)
    }

    pub fn num_deallocs(&self) -> u64 {
        self.num_deallocs.load(Ordering::Relaxed)
    }

    pub fn total_allocated_bytes(&self) -> u64 {
        self.total_allocated_bytes.load(Ordering::Relaxed)
    }

    /// Smallest enabled class that can hold `bytes`.
    fn fitting_enabled_class(&self, bytes: usize) -> Option<PageSizeClass> {
        PageSizeClass::ALL
            .iter()
            .copied()
            .find(|class| class.bytes() >= bytes && self.regions[class.index()].is_some())
    }

    fn new_page_id(&self, size_class: PageSizeClass) -> Result<PageId, BufferError> {
        let region = self.regions[size_class.index()]
            .as_ref()
            .expect("enabled size class has a region");
        let mut state = self.class_states[size_class.index()]
            .lock()
            .expect("size class lock");
        if let Some(page_id) = state.free_page_ids.pop() {
            return Ok(page_id);
        }
        if state.next_index as usize >= region.capacity_pages() {
            return Err(BufferError::OutOfBudget {
                need: size_class.bytes() as u64,
            });
        }
        let page_idx = state.next_index;
        state.next_index += 1;
        Ok(PageId::new(size_class, page_idx))
    }

    fn free_page_id(&self, page_id: PageId) {
        self.class_states[page_id.size_class().index()]
            .lock()
            .expect("size class lock")
            .free_page_ids
            .push(page_id);
    }

    /// Allocate one page that holds `bytes`, returning its address. The
    /// page is resident, dirty and registered as an eviction candidate.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8, BufferError> {
        let Some(size_class) = self.fitting_enabled_class(bytes) else {
            return Err(BufferError::TooLarge { bytes });
        };
        debug_assert!(
            alignment <= size_class.bytes(),
            "page addresses are only class-size aligned"
        );

        let page_id = self.new_page_id(size_class)?;
        let region = self.regions[size_class.index()]
            .as_ref()
            .expect("enabled size class has a region");
        let frame = region.frame(page_id);
        let ptr = region.page_address(page_id);

        // A freed id can still be in the hands of the eviction queue for a
        // moment; retry the lock instead of failing outright.
        let mut locked_from = FrameState::Evicted;
        let locked = retry_with_backoff(|| {
            let state_and_version = frame.state_and_version();
            locked_from = Frame::state(state_and_version);
            frame.try_lock_exclusive(state_and_version)
        });
        assert!(
            locked,
            "could not lock {} for exclusive access during an allocation",
            page_id
        );
        let was_evicted = locked_from == FrameState::Evicted;

        // Previously freed pages that are still resident keep their budget
        // charge; only pages coming out of Evicted need a reservation.
        if was_evicted {
            region.unprotect_page(page_id);
            let mut last_error = None;
            let reserved = retry_with_backoff(|| {
                match self.pool.ensure_free_pages(size_class.bytes() as u64) {
                    Ok(()) => true,
                    Err(err) => {
                        last_error = Some(err);
                        false
                    }
                }
            });
            if !reserved {
                region.protect_page(page_id);
                frame.unlock_exclusive_and_evict();
                self.free_page_id(page_id);
                return Err(last_error.unwrap_or(BufferError::OutOfBudget {
                    need: size_class.bytes() as u64,
                }));
            }
        }

        if self.numa_binding {
            let node_id = worker::current_worker_node_id().unwrap_or(self.pool.node_id());
            region.mbind_to_numa_node(page_id, node_id);
        }
        frame.set_dirty(true);
        frame.unlock_exclusive();
        self.pool.add_to_eviction_queue(page_id);

        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        self.total_allocated_bytes
            .fetch_add(size_class.bytes() as u64, Ordering::Relaxed);

        Ok(ptr)
    }

    /// Return a page to the allocator. The page stays resident until the
    /// eviction queue reclaims it; its id becomes reusable immediately.
    pub fn deallocate(&self, ptr: *mut u8, bytes: usize, _alignment: usize) {
        let page_id = self
            .find_page(ptr)
            .expect("deallocated pointer does not belong to any volatile region");
        debug_assert!(bytes <= page_id.num_bytes());

        let region = self.regions[page_id.size_class().index()]
            .as_ref()
            .expect("enabled size class has a region");
        let frame = region.frame(page_id);
        // Remember the state the lock was taken from: an evicted page must
        // not come back resident just because it was freed.
        let mut locked_from = FrameState::Resident;
        let locked = retry_with_backoff(|| {
            let state_and_version = frame.state_and_version();
            locked_from = Frame::state(state_and_version);
            frame.try_lock_exclusive(state_and_version)
        });
        assert!(
            locked,
            "could not lock {} for exclusive access during a deallocation",
            page_id
        );
        frame.set_dirty(false);
        if locked_from == FrameState::Evicted {
            frame.unlock_exclusive_and_evict();
        } else {
            frame.unlock_exclusive();
            self.pool.add_to_eviction_queue(page_id);
        }

        self.free_page_id(page_id);
        self.num_deallocs.fetch_add(1, Ordering::Relaxed);
        self.total_allocated_bytes
            .fetch_sub(page_id.num_bytes() as u64, Ordering::Relaxed);
    }

    /// Resolve an address handed out by `allocate` back to its page id.
    pub fn find_page(&self, ptr: *const u8) -> Option<PageId> {
        self.regions
            .iter()
            .flatten()
            .find_map(|region| region.find_page(ptr))
    }
}
