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
//! Contiguous virtual-address slab holding the pages of one size class.
//!
//! The reservation is mapped inaccessible up front; a page becomes readable
//! and writable only while resident (`unprotect_page`) and is re-protected
//! on eviction, so a use-after-evict crashes instead of corrupting memory.

use std::io;

use crate::common::ids::NodeId;
#[cfg(target_os = "linux")]
use crate::novarise_logging::debug;
use crate::storage::buffer::frame::Frame;
use crate::storage::buffer::page_id::{PageId, PageSizeClass};

pub struct VolatileRegion {
    size_class: PageSizeClass,
    base: *mut u8,
    mapped_bytes: usize,
    capacity_pages: usize,
    frames: Vec<Frame>,
}

// The raw base pointer is only dereferenced through page addresses handed
// out under frame locking; the slab itself is append-only after new().
unsafe impl Send for VolatileRegion {}
unsafe impl Sync for VolatileRegion {}

impl VolatileRegion {
    /// Reserve `virtual_bytes` of inaccessible address space partitioned
    /// into pages of the given class.
    pub fn new(size_class: PageSizeClass, virtual_bytes: usize) -> io::Result<Self> {
        let page_bytes = size_class.bytes();
        let capacity_pages = (virtual_bytes / page_bytes).max(1);
        let mapped_bytes = capacity_pages * page_bytes;

        let base = reserve_address_space(mapped_bytes)?;
        let frames = (0..capacity_pages).map(|_| Frame::new()).collect();
        Ok(Self {
            size_class,
            base,
            mapped_bytes,
            capacity_pages,
            frames,
        })
    }

    pub fn size_class(&self) -> PageSizeClass {
        self.size_class
    }

    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    fn page_offset(&self, page_id: PageId) -> usize {
        debug_assert!(page_id.valid());
        debug_assert_eq!(page_id.size_class(), self.size_class);
        debug_assert!((page_id.index() as usize) < self.capacity_pages);
        page_id.index() as usize * self.size_class.bytes()
    }

    pub fn page_address(&self, page_id: PageId) -> *mut u8 {
        unsafe { self.base.add(self.page_offset(page_id)) }
    }

    pub fn frame(&self, page_id: PageId) -> &Frame {
        debug_assert_eq!(page_id.size_class(), self.size_class);
        &self.frames[page_id.index() as usize]
    }

    /// Reverse lookup from an address inside the slab to its page id.
    pub fn find_page(&self, ptr: *const u8) -> Option<PageId> {
        let base = self.base as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.mapped_bytes {
            return None;
        }
        let index = (addr - base) / self.size_class.bytes();
        Some(PageId::new(self.size_class, index as u64))
    }

    /// Make the page accessible. Requires the caller to hold the page's
    /// frame exclusively (or be its loader).
    pub fn unprotect_page(&self, page_id: PageId) {
        protect_range(
            self.page_address(page_id),
            self.size_class.bytes(),
            true,
        );
    }

    /// Guard-page trick: any later access to the page crashes, catching
    /// use-after-evict across the allocator boundary.
    pub fn protect_page(&self, page_id: PageId) {
        protect_range(
            self.page_address(page_id),
            self.size_class.bytes(),
            false,
        );
    }

    /// Ask the OS to place the page's memory on the given NUMA node.
    /// Best-effort: unsupported platforms and failures are ignored.
    pub fn mbind_to_numa_node(&self, page_id: PageId, node_id: NodeId) {
        mbind_range(
            self.page_address(page_id),
            self.size_class.bytes(),
            node_id,
        );
    }

    /// The page's bytes for write-back.
    ///
    /// # Safety
    /// The caller must hold the frame exclusively and the page must be
    /// unprotected.
    pub(crate) unsafe fn page_slice(&self, page_id: PageId) -> &[u8] {
        std::slice::from_raw_parts(self.page_address(page_id), self.size_class.bytes())
    }

    /// The page's bytes for loading.
    ///
    /// # Safety
    /// The caller must be the page's loader and the page must be
    /// unprotected.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page_slice_mut(&self, page_id: PageId) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.page_address(page_id), self.size_class.bytes())
    }
}

impl Drop for VolatileRegion {
    fn drop(&mut self) {
        release_address_space(self.base, self.mapped_bytes);
    }
}

#[cfg(unix)]
fn reserve_address_space(bytes: usize) -> io::Result<*mut u8> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

#[cfg(unix)]
fn release_address_space(base: *mut u8, bytes: usize) {
    unsafe {
        libc::munmap(base as *mut libc::c_void, bytes);
    }
}

#[cfg(unix)]
fn protect_range(addr: *mut u8, bytes: usize, accessible: bool) {
    let prot = if accessible {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, bytes, prot) };
    debug_assert_eq!(rc, 0, "mprotect failed: {}", io::Error::last_os_error());
}

#[cfg(not(unix))]
fn reserve_address_space(bytes: usize) -> io::Result<*mut u8> {
    let layout = std::alloc::Layout::from_size_align(bytes, 4096)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let addr = unsafe { std::alloc::alloc_zeroed(layout) };
    if addr.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "region allocation failed",
        ));
    }
    Ok(addr)
}

#[cfg(not(unix))]
fn release_address_space(base: *mut u8, bytes: usize) {
    let layout = std::alloc::Layout::from_size_align(bytes, 4096).expect("region layout");
    unsafe { std::alloc::dealloc(base, layout) };
}

#[cfg(not(unix))]
fn protect_range(_addr: *mut u8, _bytes: usize, _accessible: bool) {
    // No page-protection support; use-after-evict goes undetected here.
}

#[cfg(target_os = "linux")]
fn mbind_range(addr: *mut u8, bytes: usize, node_id: NodeId) {
    const MPOL_PREFERRED: libc::c_long = 1;
    if node_id.as_u32() >= 64 {
        return;
    }
    let nodemask: u64 = 1u64 << node_id.as_u32();
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as libc::c_long,
            bytes,
            MPOL_PREFERRED,
            &nodemask as *const u64,
            64usize,
            0usize,
        )
    };
    if rc != 0 {
        debug!(
            "mbind to node {} failed: {}",
            node_id,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn mbind_range(_addr: *mut u8, _bytes: usize, _node_id: NodeId) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_addresses_do_not_alias() {
        let region =
            VolatileRegion::new(PageSizeClass::KiB4, 16 * 4096).expect("create region");
        assert_eq!(region.capacity_pages(), 16);
        let first = region.page_address(PageId::new(PageSizeClass::KiB4, 0)) as usize;
        let second = region.page_address(PageId::new(PageSizeClass::KiB4, 1)) as usize;
        assert_eq!(second - first, 4096);
    }

    #[test]
    fn find_page_inverts_page_address() {
        let region =
            VolatileRegion::new(PageSizeClass::KiB8, 8 * 8192).expect("create region");
        for index in [0u64, 3, 7] {
            let page_id = PageId::new(PageSizeClass::KiB8, index);
            let addr = region.page_address(page_id);
            assert_eq!(region.find_page(addr), Some(page_id));
            // An interior pointer resolves to the same page.
            assert_eq!(region.find_page(unsafe { addr.add(100) }), Some(page_id));
        }
        let outside = region.page_address(PageId::new(PageSizeClass::KiB8, 7));
        assert_eq!(region.find_page(unsafe { outside.add(8192) }), None);
    }

    #[test]
    fn unprotected_page_is_readable_and_writable() {
        let region =
            VolatileRegion::new(PageSizeClass::KiB4, 4 * 4096).expect("create region");
        let page_id = PageId::new(PageSizeClass::KiB4, 2);
        region.unprotect_page(page_id);
        let slice = unsafe { region.page_slice_mut(page_id) };
        slice[0] = 0xAB;
        slice[4095] = 0xCD;
        assert_eq!(slice[0], 0xAB);
        assert_eq!(slice[4095], 0xCD);
        region.protect_page(page_id);
    }
}
