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
//! Unit of schedulable work with predecessor/successor edges.
//!
//! Responsibilities:
//! - Owns the task state machine (Created, Scheduled, Enqueued, Running, Done)
//!   with CAS-guarded transitions so a task enters a queue at most once.
//! - Tracks graph edges: successors as strong forward references,
//!   predecessors as weak back-references, plus the pending-predecessor
//!   counter that gates readiness.
//! - Latches the payload outcome on completion and re-raises it to waiters.
//!
//! Key exported interfaces:
//! - Types: `Task`, `SchedulePriority`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::common::ids::{NodeId, TaskId, CURRENT_NODE_ID};
use crate::scheduler::node_queue_scheduler::current_scheduler;
use crate::scheduler::SchedulerError;

/// Queue priority of a task. `High` sub-queues drain before `Default` ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SchedulePriority {
    Default,
    High,
}

impl SchedulePriority {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            SchedulePriority::High => 0,
            SchedulePriority::Default => 1,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulePriority::High,
            _ => SchedulePriority::Default,
        }
    }
}

const STATE_CREATED: u8 = 0;
const STATE_SCHEDULED: u8 = 1;
const STATE_ENQUEUED: u8 = 2;
const STATE_RUNNING: u8 = 3;
const STATE_DONE: u8 = 4;

const TASK_ID_UNASSIGNED: u64 = u64::MAX;

pub(crate) type TaskPayload = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

#[derive(Debug)]
struct DoneState {
    done: bool,
    error: Option<String>,
}

/// A schedulable unit of work.
///
/// Tasks are created, wired into a DAG with [`Task::set_as_predecessor_of`],
/// and handed to the active scheduler with [`Task::schedule`]. A task whose
/// predecessors are all done is pushed into a node queue; a worker pops it,
/// runs the payload exactly once and propagates readiness to successors.
pub struct Task {
    id: AtomicU64,
    state: AtomicU8,
    node_id: AtomicU32,
    priority: AtomicU8,
    shutdown_task: AtomicBool,
    pending_predecessors: AtomicUsize,
    predecessors: Mutex<Vec<Weak<Task>>>,
    successors: Mutex<Vec<Arc<Task>>>,
    payload: Mutex<Option<TaskPayload>>,
    done_mu: Mutex<DoneState>,
    done_cv: Condvar,
}

impl Task {
    /// Create a job task wrapping the given payload.
    pub fn job<F>(payload: F) -> Arc<Task>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        Arc::new(Task {
            id: AtomicU64::new(TASK_ID_UNASSIGNED),
            state: AtomicU8::new(STATE_CREATED),
            node_id: AtomicU32::new(CURRENT_NODE_ID.as_u32()),
            priority: AtomicU8::new(SchedulePriority::Default.as_u8()),
            shutdown_task: AtomicBool::new(false),
            pending_predecessors: AtomicUsize::new(0),
            predecessors: Mutex::new(Vec::new()),
            successors: Mutex::new(Vec::new()),
            payload: Mutex::new(Some(Box::new(payload))),
            done_mu: Mutex::new(DoneState {
                done: false,
                error: None,
            }),
            done_cv: Condvar::new(),
        })
    }

    /// Hand this task to the active scheduler. Transitions
    /// `Created -> Scheduled` exactly once; a second call fails.
    pub fn schedule(
        self: &Arc<Self>,
        preferred_node_id: NodeId,
        priority: SchedulePriority,
    ) -> Result<(), SchedulerError> {
        let Some(scheduler) = current_scheduler() else {
            return Err(SchedulerError::InvalidState("no active scheduler"));
        };
        if !self.mark_scheduled(preferred_node_id, priority) {
            return Err(SchedulerError::InvalidState("task was already scheduled"));
        }
        scheduler.schedule(Arc::clone(self), preferred_node_id, priority);
        Ok(())
    }

    /// Store placement hints and perform the `Created -> Scheduled` CAS.
    /// Returns false when the task already left `Created`.
    pub(crate) fn mark_scheduled(&self, preferred_node_id: NodeId, priority: SchedulePriority) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_CREATED {
            return false;
        }
        self.node_id
            .store(preferred_node_id.as_u32(), Ordering::Relaxed);
        self.priority.store(priority.as_u8(), Ordering::Relaxed);
        self.state
            .compare_exchange(
                STATE_CREATED,
                STATE_SCHEDULED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Make `self` a predecessor of `successor`. Edges may only be added
    /// while `successor` has not been scheduled and `self` is not done.
    pub fn set_as_predecessor_of(
        self: &Arc<Self>,
        successor: &Arc<Task>,
    ) -> Result<(), SchedulerError> {
        if successor.state.load(Ordering::Acquire) != STATE_CREATED {
            return Err(SchedulerError::GraphClosed(
                "successor was already scheduled",
            ));
        }
        if self.state.load(Ordering::Acquire) == STATE_DONE {
            return Err(SchedulerError::GraphClosed("predecessor is already done"));
        }

        successor
            .pending_predecessors
            .fetch_add(1, Ordering::AcqRel);
        successor
            .predecessors
            .lock()
            .expect("task predecessors lock")
            .push(Arc::downgrade(self));
        self.successors
            .lock()
            .expect("task successors lock")
            .push(Arc::clone(successor));
        Ok(())
    }

    /// Block until the task is done; re-raises a latched payload failure.
    pub fn wait(&self) -> Result<(), SchedulerError> {
        let mut state = self.done_mu.lock().expect("task done lock");
        while !state.done {
            state = self
                .done_cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        match &state.error {
            Some(err) => Err(SchedulerError::PayloadFailure(err.clone())),
            None => Ok(()),
        }
    }

    pub fn done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    /// True once the task is scheduled and all predecessors are done.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SCHEDULED
            && self.pending_predecessors.load(Ordering::Acquire) == 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_SCHEDULED
    }

    pub fn id(&self) -> Option<TaskId> {
        let raw = self.id.load(Ordering::Relaxed);
        if raw == TASK_ID_UNASSIGNED {
            None
        } else {
            Some(TaskId(raw))
        }
    }

    pub(crate) fn set_id(&self, id: TaskId) {
        self.id.store(id.as_u64(), Ordering::Relaxed);
    }

    /// The preferred-node hint recorded at schedule time.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id.load(Ordering::Relaxed))
    }

    pub fn priority(&self) -> SchedulePriority {
        SchedulePriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_as_shutdown_task(&self) {
        self.shutdown_task.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown_task(&self) -> bool {
        self.shutdown_task.load(Ordering::Relaxed)
    }

    pub fn has_edges(&self) -> bool {
        !self
            .predecessors
            .lock()
            .expect("task predecessors lock")
            .is_empty()
            || !self
                .successors
                .lock()
                .expect("task successors lock")
                .is_empty()
    }

    pub fn pending_predecessor_count(&self) -> usize {
        self.pending_predecessors.load(Ordering::Acquire)
    }

    pub(crate) fn successors_snapshot(&self) -> Vec<Arc<Task>> {
        self.successors
            .lock()
            .expect("task successors lock")
            .clone()
    }

    /// `Scheduled -> Enqueued` CAS. The single guard against a task being
    /// pushed into more than one queue: of the scheduler's admission path
    /// and a predecessor's completion path, exactly one wins.
    pub(crate) fn try_mark_enqueued(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_SCHEDULED,
                STATE_ENQUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn start_running(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                STATE_ENQUEUED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        debug_assert!(transitioned, "popped task was not in Enqueued state");
    }

    /// Take and run the payload. Missing payloads (already executed) are a
    /// worker bug; treated as a no-op in release builds.
    pub(crate) fn run_payload(&self) -> Result<(), String> {
        let payload = self.payload.lock().expect("task payload lock").take();
        debug_assert!(payload.is_some(), "task payload executed twice");
        match payload {
            Some(f) => f(),
            None => Ok(()),
        }
    }

    /// Latch the outcome, publish `Done` and wake all waiters.
    pub(crate) fn finish(&self, result: Result<(), String>) {
        self.state.store(STATE_DONE, Ordering::Release);
        let mut state = self.done_mu.lock().expect("task done lock");
        state.done = true;
        if let Err(err) = result {
            state.error = Some(err);
        }
        self.done_cv.notify_all();
    }

    /// Called by the worker that completed one of our predecessors.
    /// Returns true when this task just became ready and won the
    /// enqueue CAS, i.e. the caller must push it into a queue.
    pub(crate) fn on_predecessor_done(&self) -> bool {
        let previous = self.pending_predecessors.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "predecessor count underflow");
        previous == 1 && self.try_mark_enqueued()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("node_id", &self.node_id.load(Ordering::Relaxed))
            .field(
                "pending_predecessors",
                &self.pending_predecessors.load(Ordering::Relaxed),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_update_pending_count() {
        let a = Task::job(|| Ok(()));
        let b = Task::job(|| Ok(()));
        a.set_as_predecessor_of(&b).expect("add edge");
        assert_eq!(b.pending_predecessor_count(), 1);
        assert!(b.has_edges());
        assert!(a.has_edges());
    }

    #[test]
    fn edge_to_scheduled_successor_is_rejected() {
        let a = Task::job(|| Ok(()));
        let b = Task::job(|| Ok(()));
        assert!(b.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        let err = a.set_as_predecessor_of(&b).unwrap_err();
        assert!(matches!(err, SchedulerError::GraphClosed(_)));
    }

    #[test]
    fn edge_from_done_predecessor_is_rejected() {
        let a = Task::job(|| Ok(()));
        let b = Task::job(|| Ok(()));
        a.finish(Ok(()));
        let err = a.set_as_predecessor_of(&b).unwrap_err();
        assert!(matches!(err, SchedulerError::GraphClosed(_)));
    }

    #[test]
    fn mark_scheduled_is_one_shot() {
        let task = Task::job(|| Ok(()));
        assert!(task.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::High));
        assert!(!task.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        assert_eq!(task.priority(), SchedulePriority::High);
    }

    #[test]
    fn readiness_requires_scheduled_and_zero_pending() {
        let a = Task::job(|| Ok(()));
        let b = Task::job(|| Ok(()));
        a.set_as_predecessor_of(&b).expect("add edge");
        assert!(b.mark_scheduled(CURRENT_NODE_ID, SchedulePriority::Default));
        assert!(!b.is_ready());
        // The single predecessor finished: b becomes ready and the caller
        // wins the enqueue CAS exactly once.
        assert!(b.on_predecessor_done());
        assert!(!b.try_mark_enqueued());
    }

    #[test]
    fn wait_reraises_latched_failure_to_every_waiter() {
        let task = Task::job(|| Err("boom".to_string()));
        let result = task.run_payload();
        task.finish(result);
        for _ in 0..2 {
            let err = task.wait().unwrap_err();
            assert!(matches!(err, SchedulerError::PayloadFailure(ref msg) if msg == "boom"));
        }
    }

    #[test]
    fn finish_wakes_concurrent_waiters() {
        let task = Task::job(|| Ok(()));
        let waiter = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || task.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        task.finish(Ok(()));
        assert!(waiter.join().expect("join waiter").is_ok());
        assert!(task.done());
    }
}
