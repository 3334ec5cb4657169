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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::common::ids::NodeId;
use crate::scheduler::task::{SchedulePriority, Task};

const PRIORITY_LEVELS: usize = 2;

/// Per-node queue of ready tasks, one FIFO per priority.
///
/// `estimated_load` is a relaxed counter of enqueues minus dequeues; it may
/// briefly disagree with the actual queue length and is only used as a
/// placement heuristic.
pub struct TaskQueue {
    node_id: NodeId,
    queues: [Mutex<VecDeque<Arc<Task>>>; PRIORITY_LEVELS],
    estimated_load: AtomicI64,
    idle_mu: Mutex<()>,
    idle_cv: Condvar,
}

impl TaskQueue {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            queues: [Mutex::new(VecDeque::new()), Mutex::new(VecDeque::new())],
            estimated_load: AtomicI64::new(0),
            idle_mu: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Append a task and wake one idle worker.
    pub fn push(&self, task: Arc<Task>, priority: SchedulePriority) {
        {
            let mut queue = self.queues[priority.as_u8() as usize]
                .lock()
                .expect("task queue lock");
            queue.push_back(task);
        }
        self.estimated_load.fetch_add(1, Ordering::Relaxed);
        // Taking the idle mutex orders this signal against a worker that is
        // between its emptiness re-check and the condvar wait.
        let _idle = self.idle_mu.lock().expect("task queue idle lock");
        self.idle_cv.notify_one();
    }

    /// Pop the next task, high priority first.
    pub fn pull(&self) -> Option<Arc<Task>> {
        for queue in &self.queues {
            let task = queue.lock().expect("task queue lock").pop_front();
            if let Some(task) = task {
                self.estimated_load.fetch_sub(1, Ordering::Relaxed);
                return Some(task);
            }
        }
        None
    }

    /// Pop a task on behalf of a worker from another node. Stricter than
    /// `pull`: high-priority work is never stolen, so remote workers cannot
    /// add latency to a node's urgent tasks.
    pub fn steal(&self) -> Option<Arc<Task>> {
        let task = self.queues[SchedulePriority::Default.as_u8() as usize]
            .lock()
            .expect("task queue lock")
            .pop_front();
        if task.is_some() {
            self.estimated_load.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Snapshot of the load counter; never blocks.
    pub fn estimate_load(&self) -> usize {
        self.estimated_load.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn empty(&self) -> bool {
        self.queues
            .iter()
            .all(|queue| queue.lock().expect("task queue lock").is_empty())
    }

    /// Block the calling worker until work may be available or the timeout
    /// elapses. Returns immediately when the queue is non-empty.
    pub fn wait_for_work(&self, timeout: Duration) {
        let idle = self.idle_mu.lock().expect("task queue idle lock");
        if !self.empty() {
            return;
        }
        let _ = self
            .idle_cv
            .wait_timeout(idle, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Wake every sleeping worker of this queue.
    pub fn signal_workers(&self) {
        let _idle = self.idle_mu.lock().expect("task queue idle lock");
        self.idle_cv.notify_all();
    }
}
