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
//! Per-page control block.
//!
//! A single atomic word packs the page state, the dirty bit and a 48-bit
//! version counter. The version increments on every exclusive release, so
//! a CAS against a remembered word can never succeed across an intervening
//! reuse of the page (the ABA guard of the eviction queue).
//!
//! Word layout: bits 63..56 state, bit 55 dirty, bits 47..0 version.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::util::retry_with_backoff;

const VERSION_MASK: u64 = (1 << 48) - 1;
const DIRTY_BIT: u64 = 1 << 55;
const STATE_SHIFT: u64 = 56;

const STATE_EVICTED: u64 = 0;
const STATE_LOADING: u64 = 1;
const STATE_RESIDENT: u64 = 2;
const STATE_MARKED: u64 = 3;
// 4..=0xFE encodes n shared holders as SHARED_BASE + n - 1.
const STATE_SHARED_BASE: u64 = 4;
const STATE_SHARED_MAX: u64 = 0xFE;
const STATE_LOCKED_EXCLUSIVE: u64 = 0xFF;

/// Decoded page state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    Evicted,
    Loading,
    Resident,
    /// Second-chance candidate: still resident, evicted on the next queue
    /// visit unless touched again.
    Marked,
    LockedShared(u32),
    LockedExclusive,
}

/// Per-page control block with an ABA-guarded state/version word.
#[derive(Debug)]
pub struct Frame {
    state_and_version: AtomicU64,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    /// Frames start out evicted at version zero.
    pub fn new() -> Self {
        Self {
            state_and_version: AtomicU64::new(STATE_EVICTED << STATE_SHIFT),
        }
    }

    pub fn state_and_version(&self) -> u64 {
        self.state_and_version.load(Ordering::Acquire)
    }

    pub const fn version(state_and_version: u64) -> u64 {
        state_and_version & VERSION_MASK
    }

    pub const fn is_dirty(state_and_version: u64) -> bool {
        state_and_version & DIRTY_BIT != 0
    }

    pub fn state(state_and_version: u64) -> FrameState {
        match state_and_version >> STATE_SHIFT {
            STATE_EVICTED => FrameState::Evicted,
            STATE_LOADING => FrameState::Loading,
            STATE_RESIDENT => FrameState::Resident,
            STATE_MARKED => FrameState::Marked,
            STATE_LOCKED_EXCLUSIVE => FrameState::LockedExclusive,
            shared => FrameState::LockedShared((shared - STATE_SHARED_BASE + 1) as u32),
        }
    }

    const fn with_state(state_and_version: u64, state: u64) -> u64 {
        (state << STATE_SHIFT) | (state_and_version & (DIRTY_BIT | VERSION_MASK))
    }

    const fn bump_version(state_and_version: u64, state: u64) -> u64 {
        (state << STATE_SHIFT)
            | (state_and_version & DIRTY_BIT)
            | ((Self::version(state_and_version) + 1) & VERSION_MASK)
    }

    fn compare_exchange(&self, expected: u64, desired: u64) -> bool {
        self.state_and_version
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire the exclusive lock via CAS against a remembered word. Only
    /// evicted, resident or marked pages are lockable; any other expected
    /// state (or a version mismatch) fails the CAS.
    pub fn try_lock_exclusive(&self, expected: u64) -> bool {
        match Self::state(expected) {
            FrameState::Evicted | FrameState::Resident | FrameState::Marked => self
                .compare_exchange(expected, Self::with_state(expected, STATE_LOCKED_EXCLUSIVE)),
            _ => false,
        }
    }

    /// Blocking exclusive lock: retries against the live word with
    /// exponential backoff. Gives up (false) when the frame stays pinned.
    pub fn lock_exclusive(&self) -> bool {
        retry_with_backoff(|| self.try_lock_exclusive(self.state_and_version()))
    }

    /// Add a shared holder. Fails when exclusively locked, loading or
    /// evicted, or on a version mismatch.
    pub fn try_lock_shared(&self, expected: u64) -> bool {
        let next = match Self::state(expected) {
            FrameState::Resident | FrameState::Marked => STATE_SHARED_BASE,
            FrameState::LockedShared(count) => {
                let state = STATE_SHARED_BASE + count as u64;
                if state > STATE_SHARED_MAX {
                    return false;
                }
                state
            }
            _ => return false,
        };
        self.compare_exchange(expected, Self::with_state(expected, next))
    }

    /// Drop one shared holder; the last one re-publishes `Resident`.
    /// Shared releases do not bump the version.
    pub fn unlock_shared(&self) {
        loop {
            let current = self.state_and_version();
            let next = match Self::state(current) {
                FrameState::LockedShared(1) => Self::with_state(current, STATE_RESIDENT),
                FrameState::LockedShared(count) => {
                    Self::with_state(current, STATE_SHARED_BASE + count as u64 - 2)
                }
                _ => {
                    debug_assert!(false, "unlock_shared without a shared lock");
                    return;
                }
            };
            if self.compare_exchange(current, next) {
                return;
            }
        }
    }

    /// Release the exclusive lock, publishing `Resident` and a new version.
    pub fn unlock_exclusive(&self) {
        let current = self.state_and_version();
        debug_assert_eq!(Self::state(current), FrameState::LockedExclusive);
        self.state_and_version
            .store(Self::bump_version(current, STATE_RESIDENT), Ordering::Release);
    }

    /// Release the exclusive lock, publishing `Evicted` and a new version.
    pub fn unlock_exclusive_and_evict(&self) {
        let current = self.state_and_version();
        debug_assert_eq!(Self::state(current), FrameState::LockedExclusive);
        self.state_and_version
            .store(Self::bump_version(current, STATE_EVICTED), Ordering::Release);
    }

    /// Second-chance mark: `Resident -> Marked` at the same version.
    pub fn try_mark(&self, expected: u64) -> bool {
        if Self::state(expected) != FrameState::Resident {
            return false;
        }
        self.compare_exchange(expected, Self::with_state(expected, STATE_MARKED))
    }

    /// `Evicted -> Loading` at the same version; the loader owns the page
    /// until `finish_loading` or `abort_loading`.
    pub fn try_start_loading(&self, expected: u64) -> bool {
        if Self::state(expected) != FrameState::Evicted {
            return false;
        }
        self.compare_exchange(expected, Self::with_state(expected, STATE_LOADING))
    }

    /// `Loading -> Resident` with a version bump (a load is an exclusive
    /// release as far as the ABA guard is concerned).
    pub fn finish_loading(&self) {
        let current = self.state_and_version();
        debug_assert_eq!(Self::state(current), FrameState::Loading);
        self.state_and_version
            .store(Self::bump_version(current, STATE_RESIDENT), Ordering::Release);
    }

    /// `Loading -> Evicted` at the same version; the load never happened.
    pub fn abort_loading(&self) {
        let current = self.state_and_version();
        debug_assert_eq!(Self::state(current), FrameState::Loading);
        self.state_and_version
            .store(Self::with_state(current, STATE_EVICTED), Ordering::Release);
    }

    /// Flip the dirty bit. Callers must hold the exclusive lock (or be the
    /// loader) so the bit cannot race a concurrent state transition.
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            self.state_and_version.fetch_or(DIRTY_BIT, Ordering::AcqRel);
        } else {
            self.state_and_version
                .fetch_and(!DIRTY_BIT, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_evicted_clean_version_zero() {
        let frame = Frame::new();
        let sv = frame.state_and_version();
        assert_eq!(Frame::state(sv), FrameState::Evicted);
        assert!(!Frame::is_dirty(sv));
        assert_eq!(Frame::version(sv), 0);
    }

    #[test]
    fn exclusive_lock_cycle_bumps_version() {
        let frame = Frame::new();
        let sv = frame.state_and_version();
        assert!(frame.try_lock_exclusive(sv));
        assert_eq!(
            Frame::state(frame.state_and_version()),
            FrameState::LockedExclusive
        );
        frame.unlock_exclusive();
        let sv = frame.state_and_version();
        assert_eq!(Frame::state(sv), FrameState::Resident);
        assert_eq!(Frame::version(sv), 1);
    }

    #[test]
    fn stale_word_fails_the_cas() {
        let frame = Frame::new();
        let stale = frame.state_and_version();
        assert!(frame.try_lock_exclusive(stale));
        frame.unlock_exclusive();
        // The remembered word predates the version bump.
        assert!(!frame.try_lock_exclusive(stale));
    }

    #[test]
    fn shared_locks_count_and_block_exclusive() {
        let frame = Frame::new();
        let sv = frame.state_and_version();
        assert!(frame.try_lock_exclusive(sv));
        frame.unlock_exclusive();

        let sv = frame.state_and_version();
        assert!(frame.try_lock_shared(sv));
        let sv = frame.state_and_version();
        assert_eq!(Frame::state(sv), FrameState::LockedShared(1));
        assert!(frame.try_lock_shared(sv));
        assert_eq!(
            Frame::state(frame.state_and_version()),
            FrameState::LockedShared(2)
        );
        assert!(!frame.try_lock_exclusive(frame.state_and_version()));

        frame.unlock_shared();
        frame.unlock_shared();
        assert_eq!(
            Frame::state(frame.state_and_version()),
            FrameState::Resident
        );
    }

    #[test]
    fn mark_requires_resident_and_keeps_version() {
        let frame = Frame::new();
        assert!(!frame.try_mark(frame.state_and_version()));
        assert!(frame.try_lock_exclusive(frame.state_and_version()));
        frame.unlock_exclusive();
        let sv = frame.state_and_version();
        assert!(frame.try_mark(sv));
        let marked = frame.state_and_version();
        assert_eq!(Frame::state(marked), FrameState::Marked);
        assert_eq!(Frame::version(marked), Frame::version(sv));
    }

    #[test]
    fn loading_cycle() {
        let frame = Frame::new();
        let sv = frame.state_and_version();
        assert!(frame.try_start_loading(sv));
        assert!(!frame.try_start_loading(frame.state_and_version()));
        frame.finish_loading();
        let sv = frame.state_and_version();
        assert_eq!(Frame::state(sv), FrameState::Resident);
        assert_eq!(Frame::version(sv), 1);
    }

    #[test]
    fn abort_loading_restores_evicted_without_version_bump() {
        let frame = Frame::new();
        let before = frame.state_and_version();
        assert!(frame.try_start_loading(before));
        frame.abort_loading();
        let after = frame.state_and_version();
        assert_eq!(Frame::state(after), FrameState::Evicted);
        assert_eq!(Frame::version(after), Frame::version(before));
    }

    #[test]
    fn dirty_bit_survives_lock_transitions() {
        let frame = Frame::new();
        assert!(frame.try_lock_exclusive(frame.state_and_version()));
        frame.set_dirty(true);
        frame.unlock_exclusive();
        assert!(Frame::is_dirty(frame.state_and_version()));
        assert!(frame.try_lock_exclusive(frame.state_and_version()));
        frame.set_dirty(false);
        frame.unlock_exclusive();
        assert!(!Frame::is_dirty(frame.state_and_version()));
    }
}
