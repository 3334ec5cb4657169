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
pub mod buffer_pool;
pub mod frame;
pub mod page_allocator;
pub mod page_id;
pub mod volatile_region;

use thiserror::Error;

/// Operational failures of the buffer subsystem.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The request exceeds the largest enabled size class.
    #[error("allocation of {bytes} bytes exceeds the largest enabled size class")]
    TooLarge { bytes: usize },

    /// Not enough pages could be evicted to satisfy the residency budget.
    /// Recovered with backoff by the allocator first, surfaced when it
    /// persists.
    #[error("buffer pool budget exhausted while freeing {need} bytes")]
    OutOfBudget { need: u64 },

    /// A frame read or write against the backing store failed.
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
