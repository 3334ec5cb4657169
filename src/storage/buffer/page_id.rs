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
use std::fmt;

/// Fixed, geometrically spaced page sizes. Allocations round up to the
/// smallest class that fits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum PageSizeClass {
    KiB4 = 0,
    KiB8 = 1,
    KiB16 = 2,
    KiB32 = 3,
    KiB64 = 4,
    KiB128 = 5,
    KiB256 = 6,
    KiB512 = 7,
    MiB1 = 8,
    MiB2 = 9,
}

impl PageSizeClass {
    pub const COUNT: usize = 10;

    pub const ALL: [PageSizeClass; PageSizeClass::COUNT] = [
        PageSizeClass::KiB4,
        PageSizeClass::KiB8,
        PageSizeClass::KiB16,
        PageSizeClass::KiB32,
        PageSizeClass::KiB64,
        PageSizeClass::KiB128,
        PageSizeClass::KiB256,
        PageSizeClass::KiB512,
        PageSizeClass::MiB1,
        PageSizeClass::MiB2,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn bytes(self) -> usize {
        4096usize << (self as usize)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Exact byte-size lookup, used to validate configured size classes.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|class| class.bytes() as u64 == bytes)
    }

    /// Smallest class that can hold `bytes`.
    pub fn fitting(bytes: usize) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|class| class.bytes() >= bytes)
    }
}

impl fmt::Display for PageSizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes();
        if bytes >= 1024 * 1024 {
            write!(f, "{}MiB", bytes / (1024 * 1024))
        } else {
            write!(f, "{}KiB", bytes / 1024)
        }
    }
}

/// Identifier of one page slot: size class, slot index and a valid bit.
/// Two resident page ids never alias the same address; the invalid id
/// matches no slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageId {
    size_class: PageSizeClass,
    index: u64,
    valid: bool,
}

impl PageId {
    pub const fn new(size_class: PageSizeClass, index: u64) -> Self {
        Self {
            size_class,
            index,
            valid: true,
        }
    }

    pub const fn invalid() -> Self {
        Self {
            size_class: PageSizeClass::KiB4,
            index: 0,
            valid: false,
        }
    }

    pub const fn size_class(self) -> PageSizeClass {
        self.size_class
    }

    pub const fn index(self) -> u64 {
        self.index
    }

    pub const fn valid(self) -> bool {
        self.valid
    }

    pub const fn num_bytes(self) -> usize {
        self.size_class.bytes()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(f, "page({}, {})", self.size_class, self.index)
        } else {
            write!(f, "page(invalid)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_bytes_are_powers_of_two_from_4k_to_2m() {
        assert_eq!(PageSizeClass::KiB4.bytes(), 4 * 1024);
        assert_eq!(PageSizeClass::KiB64.bytes(), 64 * 1024);
        assert_eq!(PageSizeClass::MiB2.bytes(), 2 * 1024 * 1024);
        for window in PageSizeClass::ALL.windows(2) {
            assert_eq!(window[0].bytes() * 2, window[1].bytes());
        }
    }

    #[test]
    fn fitting_rounds_up_to_the_smallest_class() {
        assert_eq!(PageSizeClass::fitting(1), Some(PageSizeClass::KiB4));
        assert_eq!(PageSizeClass::fitting(4096), Some(PageSizeClass::KiB4));
        assert_eq!(PageSizeClass::fitting(4097), Some(PageSizeClass::KiB8));
        assert_eq!(
            PageSizeClass::fitting(2 * 1024 * 1024),
            Some(PageSizeClass::MiB2)
        );
        assert_eq!(PageSizeClass::fitting(2 * 1024 * 1024 + 1), None);
    }

    #[test]
    fn from_bytes_only_accepts_exact_class_sizes() {
        assert_eq!(PageSizeClass::from_bytes(65_536), Some(PageSizeClass::KiB64));
        assert_eq!(PageSizeClass::from_bytes(65_537), None);
        assert_eq!(PageSizeClass::from_bytes(0), None);
    }

    #[test]
    fn invalid_page_id_is_not_valid() {
        assert!(!PageId::invalid().valid());
        assert!(PageId::new(PageSizeClass::KiB4, 7).valid());
    }
}
