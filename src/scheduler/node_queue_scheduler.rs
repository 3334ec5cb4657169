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
//! Node-queue scheduler: lifecycle, admission, placement and drain.
//!
//! Responsibilities:
//! - Creates one task queue per NUMA node and one pinned worker per CPU.
//! - Admits scheduled tasks, assigns task ids and places ready tasks on a
//!   node queue (explicit preference, the submitting worker's node, or a
//!   load-aware fallback).
//! - Groups flat lists of independent tiny tasks into a bounded number of
//!   chains to cut scheduling overhead.
//! - Drains everything at shutdown: wakes every worker through a barrier of
//!   flagged no-op jobs, waits until the finished-task counters converge,
//!   verifies the queues are empty and joins the workers.
//!
//! Key exported interfaces:
//! - Types: `NodeQueueScheduler`.
//! - Functions: `current_scheduler`, `set_current_scheduler`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::ids::{NodeId, TaskId, WorkerId, CURRENT_NODE_ID};
use crate::common::uid_allocator::UidAllocator;
use crate::novarise_logging::{debug, error, warn};
use crate::scheduler::task::{SchedulePriority, Task};
use crate::scheduler::task_queue::TaskQueue;
use crate::scheduler::topology::Topology;
use crate::scheduler::worker::{self, Worker};
use crate::scheduler::SchedulerError;

static CURRENT_SCHEDULER: RwLock<Option<Arc<NodeQueueScheduler>>> = RwLock::new(None);

/// Install (or clear) the process-wide scheduler used by `Task::schedule`.
pub fn set_current_scheduler(scheduler: Option<Arc<NodeQueueScheduler>>) {
    *CURRENT_SCHEDULER
        .write()
        .unwrap_or_else(|e| e.into_inner()) = scheduler;
}

/// The process-wide scheduler, if one is installed.
pub fn current_scheduler() -> Option<Arc<NodeQueueScheduler>> {
    CURRENT_SCHEDULER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Queues and workers of one `begin`..`finish` lifecycle.
struct ExecutionResources {
    queues: Vec<Arc<TaskQueue>>,
    workers: Vec<Arc<Worker>>,
    /// Tracked per node: deployments show unbalanced NUMA topologies.
    workers_per_node: Vec<usize>,
}

/// Barrier backing the shutdown wake-up: every worker runs one flagged
/// no-op job that registers here and blocks until all workers checked in.
struct ShutdownBarrier {
    registered: AtomicU64,
    released_mu: Mutex<bool>,
    released_cv: Condvar,
}

impl ShutdownBarrier {
    fn new() -> Self {
        Self {
            registered: AtomicU64::new(0),
            released_mu: Mutex::new(false),
            released_cv: Condvar::new(),
        }
    }

    fn register_and_wait(&self) {
        self.registered.fetch_add(1, Ordering::AcqRel);
        let mut released = self
            .released_mu
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while !*released {
            released = self
                .released_cv
                .wait(released)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn registered(&self) -> u64 {
        self.registered.load(Ordering::Acquire)
    }

    fn release(&self) {
        let mut released = self
            .released_mu
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *released = true;
        self.released_cv.notify_all();
    }
}

/// Work-sharing scheduler over per-node queues with pinned workers.
pub struct NodeQueueScheduler {
    topology: Topology,
    worker_id_allocator: UidAllocator,
    resources: Mutex<Option<Arc<ExecutionResources>>>,
    active: AtomicBool,
    shutdown_flag: Arc<AtomicBool>,
    task_counter: AtomicU64,
    finish_mutex: Mutex<()>,
}

impl NodeQueueScheduler {
    pub fn new(topology: Topology) -> Arc<Self> {
        Arc::new(Self {
            topology,
            worker_id_allocator: UidAllocator::new(),
            resources: Mutex::new(None),
            active: AtomicBool::new(false),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            task_counter: AtomicU64::new(0),
            finish_mutex: Mutex::new(()),
        })
    }

    pub fn new_from_config() -> Arc<Self> {
        Self::new(Topology::from_config())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn queues(&self) -> Vec<Arc<TaskQueue>> {
        self.resources_snapshot()
            .map(|r| r.queues.clone())
            .unwrap_or_default()
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.resources_snapshot()
            .map(|r| r.workers.clone())
            .unwrap_or_default()
    }

    /// Number of tasks admitted in the current lifecycle.
    pub fn total_scheduled_tasks(&self) -> u64 {
        self.task_counter.load(Ordering::Acquire)
    }

    fn resources_snapshot(&self) -> Option<Arc<ExecutionResources>> {
        self.resources
            .lock()
            .expect("scheduler resources lock")
            .clone()
    }

    /// Create the queues and workers and wait until every worker thread is
    /// pinned and running.
    pub fn begin(&self) -> Result<(), SchedulerError> {
        if self.active.load(Ordering::Acquire) {
            return Err(SchedulerError::InvalidState("scheduler is already active"));
        }
        self.shutdown_flag.store(false, Ordering::Release);

        let wait_timeout = Duration::from_millis(config::worker_wait_timeout_ms().max(1));
        let nodes = self.topology.nodes();
        let queues: Vec<Arc<TaskQueue>> = nodes
            .iter()
            .map(|node| Arc::new(TaskQueue::new(node.node_id)))
            .collect();

        let mut workers = Vec::with_capacity(self.topology.num_cpus());
        let mut workers_per_node = Vec::with_capacity(nodes.len());
        for (node_idx, node) in nodes.iter().enumerate() {
            // Steal order: ring distance, nearest following node first.
            let mut steal_queues = Vec::with_capacity(queues.len().saturating_sub(1));
            steal_queues.extend(queues[node_idx + 1..].iter().cloned());
            steal_queues.extend(queues[..node_idx].iter().cloned());

            for cpu in &node.cpus {
                workers.push(Worker::new(
                    WorkerId(self.worker_id_allocator.allocate()),
                    cpu.cpu_id,
                    Arc::clone(&queues[node_idx]),
                    steal_queues.clone(),
                    Arc::clone(&self.shutdown_flag),
                    wait_timeout,
                ));
            }
            workers_per_node.push(node.cpus.len());
        }

        let resources = Arc::new(ExecutionResources {
            queues,
            workers,
            workers_per_node,
        });
        *self.resources.lock().expect("scheduler resources lock") = Some(Arc::clone(&resources));
        self.active.store(true, Ordering::Release);

        for worker in &resources.workers {
            worker.start();
        }
        for worker in &resources.workers {
            while !worker.is_ready() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    /// Admit a task that already transitioned to `Scheduled`. Assigns the
    /// task id; ready tasks are placed on a node queue, the rest are
    /// enqueued later by their last finishing predecessor.
    pub fn schedule(
        &self,
        task: Arc<Task>,
        preferred_node_id: NodeId,
        priority: SchedulePriority,
    ) {
        debug_assert!(
            self.active(),
            "can't schedule more tasks after the scheduler was shut down"
        );
        debug_assert!(
            task.is_scheduled(),
            "don't admit directly, call schedule() on the task"
        );

        let task_counter = self.task_counter.fetch_add(1, Ordering::AcqRel);
        task.set_id(TaskId(task_counter));

        if !task.is_ready() {
            return;
        }

        let Some(resources) = self.resources_snapshot() else {
            return;
        };
        let queue_idx = self.determine_queue_id(&resources, preferred_node_id);
        debug_assert!(
            queue_idx < resources.queues.len(),
            "node id is not within range of available nodes"
        );
        if task.try_mark_enqueued() {
            resources.queues[queue_idx].push(task, priority);
        }
    }

    fn determine_queue_id(
        &self,
        resources: &ExecutionResources,
        preferred_node_id: NodeId,
    ) -> usize {
        // Early out: nothing to decide with a single node queue.
        if resources.queues.len() == 1 {
            return 0;
        }

        if preferred_node_id != CURRENT_NODE_ID {
            return preferred_node_id.as_usize();
        }

        // If the current node is requested, try to obtain it from the
        // submitting worker.
        if let Some(node_id) = worker::current_worker_node_id() {
            return node_id.as_usize();
        }

        // The master-thread submission path: node 0 wins outright while it
        // has fewer queued tasks than workers, giving O(1) placement.
        let mut min_load_node = 0usize;
        let mut min_load = resources.queues[0].estimate_load();
        if min_load < resources.workers_per_node[0] {
            return 0;
        }

        for (node_idx, queue) in resources.queues.iter().enumerate().skip(1) {
            let load = queue.estimate_load();
            if load < min_load {
                min_load_node = node_idx;
                min_load = load;
            }
        }
        min_load_node
    }

    /// Schedule a whole batch of tasks with default placement and priority.
    pub fn schedule_tasks(&self, tasks: &[Arc<Task>]) {
        for task in tasks {
            let transitioned =
                task.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default);
            debug_assert!(transitioned, "task in schedule_tasks was already scheduled");
            if transitioned {
                self.schedule(Arc::clone(task), CURRENT_NODE_ID, SchedulePriority::Default);
            }
        }
    }

    pub fn schedule_and_wait_for_tasks(
        &self,
        tasks: &[Arc<Task>],
    ) -> Result<(), SchedulerError> {
        self.schedule_tasks(tasks);
        for task in tasks {
            task.wait()?;
        }
        Ok(())
    }

    /// Insert predecessor/successor edges so that at most `num_groups`
    /// chains of the given independent tasks can run in parallel. No-op
    /// when any task is already wired into a graph (adding edges there
    /// could introduce cycles) or is a shutdown task.
    pub fn group_tasks(&self, tasks: &[Arc<Task>]) {
        let num_groups = config::actual_num_groups().max(1);
        if tasks
            .iter()
            .any(|task| task.has_edges() || task.is_shutdown_task())
        {
            return;
        }

        let mut common_node_id: Option<NodeId> = None;
        let mut grouped_tasks: Vec<Option<Arc<Task>>> = vec![None; num_groups];
        for (round_robin_counter, task) in tasks.iter().enumerate() {
            if let Some(common) = common_node_id {
                // The chain runs on whichever worker pops its head, so all
                // but the first node hint would be ignored anyway.
                debug_assert_eq!(
                    task.node_id(),
                    common,
                    "expected all grouped tasks to have the same node_id"
                );
            } else {
                common_node_id = Some(task.node_id());
            }

            let group_id = round_robin_counter % num_groups;
            if let Some(first_task_in_group) = &grouped_tasks[group_id] {
                task.set_as_predecessor_of(first_task_in_group)
                    .expect("grouped tasks are unscheduled");
            }
            grouped_tasks[group_id] = Some(Arc::clone(task));
        }
    }

    /// Spin until the finished-task counters of all workers account for
    /// every admitted task. Callable from the submitting thread only.
    pub fn wait_for_all_tasks(&self) -> Result<(), SchedulerError> {
        let Some(resources) = self.resources_snapshot() else {
            return Ok(());
        };
        let poll = Duration::from_millis(config::wait_poll_ms().max(1));
        let deadline = Instant::now() + Duration::from_millis(config::shutdown_timeout_ms());
        loop {
            let num_finished_tasks: u64 = resources
                .workers
                .iter()
                .map(|worker| worker.num_finished_tasks())
                .sum();
            if num_finished_tasks == self.task_counter.load(Ordering::Acquire) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SchedulerError::ScheduleTimeout(format!(
                    "{} of {} tasks finished",
                    num_finished_tasks,
                    self.task_counter.load(Ordering::Acquire)
                )));
            }
            thread::sleep(poll);
        }
    }

    /// Drain and stop. Idempotent; the first call wins, later calls return
    /// immediately.
    pub fn finish(&self) -> Result<(), SchedulerError> {
        let _finish = self.finish_mutex.lock().unwrap_or_else(|e| e.into_inner());
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }
        let resources = self
            .resources_snapshot()
            .expect("active scheduler has resources");

        // Wake-up barrier: workers sleeping on empty queues would only
        // notice the shutdown flag after their wait timeout; one flagged
        // no-op job per worker per node forces every worker awake, and
        // blocking the jobs until all workers checked in stops a single
        // worker from swallowing several of them. The jobs go out before
        // the flag flips so no worker can slip out between the two.
        let workers_total = resources.workers.len() as u64;
        let barrier = Arc::new(ShutdownBarrier::new());
        for (node_idx, &node_worker_count) in resources.workers_per_node.iter().enumerate() {
            for _ in 0..node_worker_count {
                let barrier = Arc::clone(&barrier);
                let ping = Task::job(move || {
                    barrier.register_and_wait();
                    Ok(())
                });
                ping.set_as_shutdown_task();
                let transitioned =
                    ping.mark_scheduled(NodeId(node_idx as u32), SchedulePriority::Default);
                debug_assert!(transitioned);
                self.schedule(ping, NodeId(node_idx as u32), SchedulePriority::Default);
            }
        }

        self.shutdown_flag.store(true, Ordering::Release);

        // The registration wait is diagnostic only: the barrier is released
        // after the timeout regardless, and stragglers drain through the
        // regular worker loop.
        let deadline = Instant::now() + Duration::from_millis(config::shutdown_timeout_ms());
        let mut check_runs = 0u64;
        while barrier.registered() < workers_total {
            if Instant::now() >= deadline {
                warn!(
                    "shutdown barrier: only {} of {} workers registered before timeout",
                    barrier.registered(),
                    workers_total
                );
                break;
            }
            if check_runs > 50 && check_runs % 50 == 0 {
                let loads: Vec<String> = resources
                    .queues
                    .iter()
                    .map(|queue| queue.estimate_load().to_string())
                    .collect();
                debug!(
                    "shutdown barrier: {} of {} workers registered; queue loads: {}",
                    barrier.registered(),
                    workers_total,
                    loads.join("\t")
                );
            }
            thread::sleep(Duration::from_millis(1));
            check_runs += 1;
        }
        barrier.release();

        self.wait_for_all_tasks()?;

        // The empty() check can be momentarily stale when many tiny tasks
        // were scheduled; re-signal the workers while it settles.
        for queue in &resources.queues {
            let mut queue_check_runs = 0usize;
            while !queue.empty() {
                if queue_check_runs >= 1000 {
                    return Err(SchedulerError::ScheduleTimeout(format!(
                        "queue {} is not empty but all admitted tasks have been processed",
                        queue.node_id()
                    )));
                }
                queue.signal_workers();
                thread::sleep(Duration::from_millis(1));
                queue_check_runs += 1;
            }
        }

        self.active.store(false, Ordering::Release);
        for worker in &resources.workers {
            worker.join();
        }
        *self.resources.lock().expect("scheduler resources lock") = None;
        self.task_counter.store(0, Ordering::Release);
        Ok(())
    }
}

impl Drop for NodeQueueScheduler {
    fn drop(&mut self) {
        if self.active.load(Ordering::Relaxed) {
            error!("NodeQueueScheduler dropped without finish()");
            debug_assert!(false, "NodeQueueScheduler::finish() wasn't called prior to drop");
        }
    }
}
