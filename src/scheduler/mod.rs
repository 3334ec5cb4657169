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
pub mod node_queue_scheduler;
pub mod task;
pub mod task_queue;
pub mod topology;
pub mod worker;

use thiserror::Error;

/// Operational failures of the task-execution subsystem. Misuse that a
/// correct caller can never trigger (scheduling after shutdown, node ids
/// out of range) is handled with debug assertions instead.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A lifecycle transition was requested from the wrong state, e.g. a
    /// task scheduled twice or a scheduler started while already active.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A graph edge was added to a task that already left the build phase.
    #[error("task graph closed: {0}")]
    GraphClosed(&'static str),

    /// The shutdown drain did not converge within its safety bound.
    #[error("scheduler drain timed out: {0}")]
    ScheduleTimeout(String),

    /// The task's payload returned an error or panicked; latched on the
    /// task and re-raised to every waiter.
    #[error("task payload failed: {0}")]
    PayloadFailure(String),
}
