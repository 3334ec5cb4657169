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
//! End-to-end tests of the node-queue scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use novarise::scheduler::topology::Topology;
use novarise::{
    set_current_scheduler, NodeId, NodeQueueScheduler, SchedulePriority, SchedulerError, Task,
    CURRENT_NODE_ID,
};

// Task::schedule goes through the process-wide scheduler cell, so tests
// that install one must not overlap.
static SCHEDULER_LOCK: Mutex<()> = Mutex::new(());

struct SchedulerFixture {
    _guard: MutexGuard<'static, ()>,
    scheduler: Arc<NodeQueueScheduler>,
}

impl SchedulerFixture {
    fn start(nodes: usize, workers_per_node: usize) -> Self {
        let guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let scheduler = NodeQueueScheduler::new(Topology::fake(nodes, workers_per_node));
        scheduler.begin().expect("begin scheduler");
        set_current_scheduler(Some(Arc::clone(&scheduler)));
        Self {
            _guard: guard,
            scheduler,
        }
    }

    fn finished_task_sum(&self) -> u64 {
        self.scheduler
            .workers()
            .iter()
            .map(|worker| worker.num_finished_tasks())
            .sum()
    }
}

impl Drop for SchedulerFixture {
    fn drop(&mut self) {
        set_current_scheduler(None);
        self.scheduler.finish().expect("finish scheduler");
    }
}

#[test]
fn chain_of_tasks_runs_in_edge_order() {
    let fixture = SchedulerFixture::start(1, 4);
    const CHAIN_LEN: usize = 1000;

    let counter = Arc::new(AtomicUsize::new(0));
    let in_order = Arc::new(AtomicBool::new(true));
    let tasks: Vec<Arc<Task>> = (0..CHAIN_LEN)
        .map(|position| {
            let counter = Arc::clone(&counter);
            let in_order = Arc::clone(&in_order);
            Task::job(move || {
                let previous = counter.fetch_add(1, Ordering::AcqRel);
                if previous != position {
                    in_order.store(false, Ordering::Release);
                }
                Ok(())
            })
        })
        .collect();
    for window in tasks.windows(2) {
        window[0]
            .set_as_predecessor_of(&window[1])
            .expect("chain edge");
    }

    for task in &tasks {
        task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
            .expect("schedule chain task");
    }
    fixture
        .scheduler
        .wait_for_all_tasks()
        .expect("drain the chain");

    assert_eq!(counter.load(Ordering::Acquire), CHAIN_LEN);
    assert!(in_order.load(Ordering::Acquire), "a task ran before its predecessor");
    assert_eq!(fixture.finished_task_sum(), CHAIN_LEN as u64);
}

#[test]
fn diamond_joins_after_both_branches() {
    let fixture = SchedulerFixture::start(1, 2);

    let b_done = Arc::new(Mutex::new(None::<Instant>));
    let c_done = Arc::new(Mutex::new(None::<Instant>));
    let d_start = Arc::new(Mutex::new(None::<Instant>));

    let a = Task::job(|| Ok(()));
    let b = {
        let b_done = Arc::clone(&b_done);
        Task::job(move || {
            std::thread::sleep(Duration::from_millis(50));
            *b_done.lock().expect("b_done lock") = Some(Instant::now());
            Ok(())
        })
    };
    let c = {
        let c_done = Arc::clone(&c_done);
        Task::job(move || {
            std::thread::sleep(Duration::from_millis(100));
            *c_done.lock().expect("c_done lock") = Some(Instant::now());
            Ok(())
        })
    };
    let d = {
        let d_start = Arc::clone(&d_start);
        Task::job(move || {
            *d_start.lock().expect("d_start lock") = Some(Instant::now());
            Ok(())
        })
    };

    a.set_as_predecessor_of(&b).expect("a->b");
    a.set_as_predecessor_of(&c).expect("a->c");
    b.set_as_predecessor_of(&d).expect("b->d");
    c.set_as_predecessor_of(&d).expect("c->d");

    let started = Instant::now();
    for task in [&a, &b, &c, &d] {
        task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
            .expect("schedule diamond task");
    }
    d.wait().expect("wait for join task");
    let elapsed = started.elapsed();

    let b_done = b_done.lock().expect("b_done lock").expect("b ran");
    let c_done = c_done.lock().expect("c_done lock").expect("c ran");
    let d_start = d_start.lock().expect("d_start lock").expect("d ran");
    assert!(d_start >= b_done, "join started before the fast branch finished");
    assert!(d_start >= c_done, "join started before the slow branch finished");
    // With two workers the branches overlap: ~100ms, not 150ms.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(
        elapsed < Duration::from_millis(150),
        "branches did not run in parallel: {elapsed:?}"
    );
}

#[test]
fn grouped_independent_tasks_all_finish_with_bounded_parallelism() {
    let fixture = SchedulerFixture::start(1, 4);
    const TASK_COUNT: usize = 10_000;

    let finished = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Arc<Task>> = (0..TASK_COUNT)
        .map(|_| {
            let finished = Arc::clone(&finished);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            Task::job(move || {
                let now = running.fetch_add(1, Ordering::AcqRel) + 1;
                max_running.fetch_max(now, Ordering::AcqRel);
                finished.fetch_add(1, Ordering::AcqRel);
                running.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            })
        })
        .collect();

    fixture.scheduler.group_tasks(&tasks);
    fixture
        .scheduler
        .schedule_and_wait_for_tasks(&tasks)
        .expect("run grouped tasks");

    assert_eq!(finished.load(Ordering::Acquire), TASK_COUNT);
    // Grouping leaves at most num_groups runnable chains.
    let num_groups = 4 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    assert!(
        max_running.load(Ordering::Acquire) <= num_groups,
        "more tasks ran concurrently than grouped chains exist"
    );
    assert_eq!(fixture.finished_task_sum(), TASK_COUNT as u64);
}

#[test]
fn finish_drains_in_flight_tasks_without_cancelling() {
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Arc<Task>> = {
        let fixture = SchedulerFixture::start(2, 2);
        const TASK_COUNT: usize = 1000;
        let tasks: Vec<Arc<Task>> = (0..TASK_COUNT)
            .map(|position| {
                let counter = Arc::clone(&counter);
                Task::job(move || {
                    if position % 100 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    counter.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                })
            })
            .collect();
        for task in &tasks {
            task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
                .expect("schedule task");
        }
        // Fixture drop runs finish() with work still in flight.
        tasks
    };

    assert_eq!(counter.load(Ordering::Acquire), tasks.len());
    for task in &tasks {
        assert!(task.done(), "finish() cancelled a submitted task");
    }
}

#[test]
fn remote_task_is_stolen_and_executed_exactly_once() {
    let fixture = SchedulerFixture::start(3, 1);

    let executions = Arc::new(AtomicU64::new(0));
    // Busy task pins node 2's only worker so the victim must be stolen.
    let blocker = Task::job(|| {
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    let victim = {
        let executions = Arc::clone(&executions);
        Task::job(move || {
            executions.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    };

    blocker
        .schedule(NodeId::new(2), SchedulePriority::Default)
        .expect("schedule blocker");
    victim
        .schedule(NodeId::new(2), SchedulePriority::Default)
        .expect("schedule victim");

    victim.wait().expect("victim executes");
    blocker.wait().expect("blocker executes");
    fixture
        .scheduler
        .wait_for_all_tasks()
        .expect("drain");

    assert_eq!(executions.load(Ordering::Acquire), 1);
    for queue in fixture.scheduler.queues() {
        assert_eq!(queue.estimate_load(), 0);
        assert!(queue.empty());
    }
}

#[test]
fn wait_is_idempotent_across_many_waiters() {
    let _fixture = SchedulerFixture::start(1, 2);

    let task = Task::job(|| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    });
    task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .expect("schedule task");

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let task = Arc::clone(&task);
            std::thread::spawn(move || task.wait())
        })
        .collect();
    for waiter in waiters {
        waiter.join().expect("join waiter").expect("wait succeeds");
    }
    task.wait().expect("late wait also succeeds");
}

#[test]
fn double_schedule_is_rejected() {
    let _fixture = SchedulerFixture::start(1, 1);

    let task = Task::job(|| Ok(()));
    task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .expect("first schedule");
    let err = task
        .schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)));
    task.wait().expect("task still runs once");
}

#[test]
fn payload_failure_is_reraised_from_wait() {
    let _fixture = SchedulerFixture::start(1, 1);

    let task = Task::job(|| Err("tuple count mismatch".to_string()));
    task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .expect("schedule failing task");
    let err = task.wait().unwrap_err();
    assert!(
        matches!(err, SchedulerError::PayloadFailure(ref msg) if msg.contains("tuple count mismatch"))
    );
}

#[test]
fn panicking_payload_is_latched_not_fatal() {
    let _fixture = SchedulerFixture::start(1, 2);

    let task = Task::job(|| panic!("segment decode failed"));
    task.schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .expect("schedule panicking task");
    let err = task.wait().unwrap_err();
    assert!(matches!(err, SchedulerError::PayloadFailure(ref msg) if msg.contains("segment decode failed")));

    // The worker that caught the panic keeps executing.
    let follow_up = Task::job(|| Ok(()));
    follow_up
        .schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .expect("schedule follow-up");
    follow_up.wait().expect("worker survived the panic");
}

#[test]
fn scheduling_without_an_installed_scheduler_fails() {
    let _guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let task = Task::job(|| Ok(()));
    let err = task
        .schedule(CURRENT_NODE_ID, SchedulePriority::Default)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidState(_)));
}

#[test]
fn high_priority_tasks_overtake_default_ones() {
    let fixture = SchedulerFixture::start(1, 1);

    // One worker: stall it, then queue default tasks before a high one.
    let order = Arc::new(Mutex::new(Vec::new()));
    let blocker = Task::job(|| {
        std::thread::sleep(Duration::from_millis(30));
        Ok(())
    });
    blocker
        .schedule(NodeId::new(0), SchedulePriority::Default)
        .expect("schedule blocker");

    let mut tasks = Vec::new();
    for label in ["default-1", "default-2"] {
        let order = Arc::clone(&order);
        let task = Task::job(move || {
            order.lock().expect("order lock").push(label);
            Ok(())
        });
        task.schedule(NodeId::new(0), SchedulePriority::Default)
            .expect("schedule default task");
        tasks.push(task);
    }
    let high = {
        let order = Arc::clone(&order);
        Task::job(move || {
            order.lock().expect("order lock").push("high");
            Ok(())
        })
    };
    high.schedule(NodeId::new(0), SchedulePriority::High)
        .expect("schedule high task");

    fixture.scheduler.wait_for_all_tasks().expect("drain");
    let order = order.lock().expect("order lock");
    assert_eq!(order.first(), Some(&"high"));
}
