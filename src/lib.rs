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
pub mod common;
pub mod scheduler;
pub mod storage;

// Hyrise-BE-like folder layout, with `novarise_*` convenience aliases.
pub use common::app_config as novarise_config;
pub use common::logging as novarise_logging;
pub use scheduler::node_queue_scheduler as novarise_scheduler;
pub use storage::buffer as novarise_buffer;

pub use common::ids::{CpuId, NodeId, TaskId, WorkerId, CURRENT_NODE_ID};
pub use scheduler::node_queue_scheduler::{
    current_scheduler, set_current_scheduler, NodeQueueScheduler,
};
pub use scheduler::task::{SchedulePriority, Task};
pub use scheduler::SchedulerError;
pub use storage::buffer::page_allocator::PageAllocator;
pub use storage::buffer::BufferError;
