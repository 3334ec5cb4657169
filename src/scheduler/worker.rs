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
//! Pinned worker thread of the node-queue scheduler.
//!
//! Responsibilities:
//! - Pops ready tasks from its node's queue, runs them to completion and
//!   propagates readiness to successors.
//! - Steals default-priority work from other nodes when its own queue is
//!   empty, nearest node first.
//! - Exits only once the shutdown flag is set, its own queue is drained and
//!   no peer queue has stealable work left.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::common::ids::{CpuId, NodeId, WorkerId};
use crate::novarise_logging::debug;
use crate::scheduler::task::Task;
use crate::scheduler::task_queue::TaskQueue;
use crate::scheduler::topology;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Return the worker owning the calling thread, if the caller is one.
pub fn get_this_thread_worker() -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|worker| worker.borrow().clone())
}

/// NUMA node of the calling worker thread, if the caller is one.
pub fn current_worker_node_id() -> Option<NodeId> {
    get_this_thread_worker().map(|worker| worker.queue().node_id())
}

pub struct Worker {
    id: WorkerId,
    cpu_id: CpuId,
    queue: Arc<TaskQueue>,
    /// Peer queues in steal order: nearest node first.
    steal_queues: Vec<Arc<TaskQueue>>,
    shutdown_flag: Arc<AtomicBool>,
    ready: AtomicBool,
    num_finished_tasks: AtomicU64,
    wait_timeout: Duration,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        cpu_id: CpuId,
        queue: Arc<TaskQueue>,
        steal_queues: Vec<Arc<TaskQueue>>,
        shutdown_flag: Arc<AtomicBool>,
        wait_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            cpu_id,
            queue,
            steal_queues,
            shutdown_flag,
            ready: AtomicBool::new(false),
            num_finished_tasks: AtomicU64::new(0),
            wait_timeout,
            thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn cpu_id(&self) -> CpuId {
        self.cpu_id
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// One-shot readiness flag, set once the thread is pinned and running.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn num_finished_tasks(&self) -> u64 {
        self.num_finished_tasks.load(Ordering::Relaxed)
    }

    /// Spawn and pin the OS thread. Created stopped; call exactly once.
    pub(crate) fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || {
                topology::pin_thread_to_cpu(worker.cpu_id);
                CURRENT_WORKER.with(|current| {
                    *current.borrow_mut() = Some(Arc::clone(&worker));
                });
                worker.ready.store(true, Ordering::Release);
                worker.run();
                CURRENT_WORKER.with(|current| {
                    current.borrow_mut().take();
                });
            })
            .expect("spawn worker thread");
        *self.thread.lock().expect("worker thread lock") = Some(handle);
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().expect("worker thread lock").take() {
            let _ = handle.join();
        }
    }

    fn run(self: &Arc<Self>) {
        loop {
            if let Some(task) = self.queue.pull() {
                self.process(task);
                continue;
            }
            if let Some(task) = self.try_steal() {
                self.process(task);
                continue;
            }
            if self.shutdown_flag.load(Ordering::Acquire) {
                if self.queue.empty() {
                    break;
                }
                continue;
            }
            self.queue.wait_for_work(self.wait_timeout);
        }
        debug!(
            "worker {} exiting after {} finished task(s)",
            self.id,
            self.num_finished_tasks()
        );
    }

    /// Scan peer queues in steal order; one task at a time to limit
    /// imbalance overshoot.
    fn try_steal(&self) -> Option<Arc<Task>> {
        for queue in &self.steal_queues {
            if let Some(task) = queue.steal() {
                return Some(task);
            }
        }
        None
    }

    pub(crate) fn process(&self, task: Arc<Task>) {
        task.start_running();

        let outcome = catch_unwind(AssertUnwindSafe(|| task.run_payload())).unwrap_or_else(
            |payload| {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                Err(format!("panic in task payload: {msg}"))
            },
        );

        // Publish Done before releasing successors so a successor that
        // starts immediately observes every predecessor terminal.
        task.finish(outcome);
        self.enqueue_ready_successors(&task);
        self.num_finished_tasks.fetch_add(1, Ordering::Relaxed);
    }

    fn enqueue_ready_successors(&self, task: &Arc<Task>) {
        for successor in task.successors_snapshot() {
            if successor.on_predecessor_done() {
                let priority = successor.priority();
                self.queue.push(successor, priority);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::CURRENT_NODE_ID;
    use crate::scheduler::task::SchedulePriority;
    use std::sync::atomic::AtomicUsize;

    fn idle_worker(queue: Arc<TaskQueue>) -> Arc<Worker> {
        Worker::new(
            WorkerId(0),
            CpuId(0),
            queue,
            Vec::new(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(10),
        )
    }

    fn enqueued_task<F>(payload: F) -> Arc<Task>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let task = Task::job(payload);
        assert!(task.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        assert!(task.try_mark_enqueued());
        task
    }

    #[test]
    fn process_runs_payload_and_counts() {
        let queue = Arc::new(TaskQueue::new(NodeId(0)));
        let worker = idle_worker(Arc::clone(&queue));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let task = enqueued_task(move || {
            counter_clone.fetch_add(1, Ordering::AcqRel);
            Ok(())
        });

        worker.process(Arc::clone(&task));
        assert!(task.done());
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert_eq!(worker.num_finished_tasks(), 1);
    }

    #[test]
    fn process_latches_panic_as_failure() {
        let queue = Arc::new(TaskQueue::new(NodeId(0)));
        let worker = idle_worker(Arc::clone(&queue));
        let task = enqueued_task(|| panic!("kaput"));

        worker.process(Arc::clone(&task));
        assert!(task.done());
        let err = task.wait().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("kaput"), "unexpected error: {msg}");
    }

    #[test]
    fn finished_task_enqueues_ready_successor_locally() {
        let queue = Arc::new(TaskQueue::new(NodeId(0)));
        let worker = idle_worker(Arc::clone(&queue));

        let pred = Task::job(|| Ok(()));
        let succ = Task::job(|| Ok(()));
        pred.set_as_predecessor_of(&succ).expect("add edge");
        assert!(pred.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        assert!(succ.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        assert!(pred.try_mark_enqueued());

        worker.process(Arc::clone(&pred));
        let popped = queue.pull().expect("successor was enqueued");
        assert!(Arc::ptr_eq(&popped, &succ));
    }
}
