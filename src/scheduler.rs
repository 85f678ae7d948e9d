//! Background worker that runs deferred proxy work once its precondition
//! holds: replaying a write log when the ticket comes up, buffering a
//! read-only copy, committing a read-only proxy early.
//!
//! Conditions are re-evaluated whenever a host opens one of its gates
//! ([`TaskScheduler::ping`]), with a periodic fallback so a missed wakeup
//! only costs latency.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::OptsvaError;

const IDLE_RECHECK: Duration = Duration::from_millis(25);

type Condition = Box<dyn FnMut() -> bool + Send>;
type Action = Box<dyn FnOnce() -> Result<(), OptsvaError> + Send>;

/// A `(condition, action)` pair. The action runs once, on the scheduler
/// thread, after the condition first evaluates to true.
pub struct Task {
    name: &'static str,
    condition: Condition,
    action: Action,
}

impl Task {
    pub fn new(
        name: &'static str,
        condition: impl FnMut() -> bool + Send + 'static,
        action: impl FnOnce() -> Result<(), OptsvaError> + Send + 'static,
    ) -> Self {
        Self {
            name,
            condition: Box::new(condition),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    woken: bool,
    stopping: bool,
    failure: Option<String>,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("TaskScheduler")
            .field("pending", &queue.tasks.len())
            .field("stopping", &queue.stopping)
            .field("failure", &queue.failure)
            .finish()
    }
}

impl TaskScheduler {
    pub fn start() -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("optsva-scheduler".into())
            .spawn(move || run_worker(&worker_shared));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                shared.queue.lock().failure = Some(format!("cannot spawn scheduler thread: {err}"));
                None
            }
        };
        Arc::new(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    pub fn submit(&self, task: Task) -> Result<(), OptsvaError> {
        let mut queue = self.shared.queue.lock();
        if let Some(failure) = &queue.failure {
            return Err(OptsvaError::SchedulerFailed(failure.clone()));
        }
        if queue.stopping {
            return Err(OptsvaError::ServiceStopped("task scheduler"));
        }
        debug!(task = task.name, "task submitted");
        queue.tasks.push_back(task);
        queue.woken = true;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Asks the worker to re-evaluate every pending condition.
    pub fn ping(&self) {
        let mut queue = self.shared.queue.lock();
        queue.woken = true;
        self.shared.wake.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn failure(&self) -> Option<String> {
        self.shared.queue.lock().failure.clone()
    }

    /// Fails once the worker stopped, so nobody waits forever on work that
    /// will never run.
    pub fn health(&self) -> Result<(), OptsvaError> {
        let queue = self.shared.queue.lock();
        if let Some(failure) = &queue.failure {
            return Err(OptsvaError::SchedulerFailed(failure.clone()));
        }
        if queue.stopping {
            return Err(OptsvaError::ServiceStopped("task scheduler"));
        }
        Ok(())
    }

    /// Runs one last pass over the queue, drops whatever is still not ready
    /// and joins the worker.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            queue.woken = true;
            self.shared.wake.notify_one();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let ready = {
            let mut queue = shared.queue.lock();
            while !queue.woken {
                if shared.wake.wait_for(&mut queue, IDLE_RECHECK).timed_out() {
                    break;
                }
            }
            queue.woken = false;
            let ready = take_ready(&mut queue.tasks);
            if ready.is_empty() && queue.stopping {
                if !queue.tasks.is_empty() {
                    warn!(dropped = queue.tasks.len(), "scheduler stopped with tasks pending");
                    queue.tasks.clear();
                }
                return;
            }
            ready
        };

        // Actions run without the queue lock: they submit follow-up work and
        // open gates, which pings back into the queue.
        for task in ready {
            let name = task.name;
            if let Err(err) = (task.action)() {
                error!(task = name, error = %err, "background task failed; scheduler stopping");
                let mut queue = shared.queue.lock();
                queue.failure = Some(format!("{name}: {err}"));
                queue.tasks.clear();
                return;
            }
            debug!(task = name, "task completed");
        }
    }
}

fn take_ready(tasks: &mut VecDeque<Task>) -> Vec<Task> {
    let mut ready = Vec::new();
    let mut waiting = VecDeque::with_capacity(tasks.len());
    while let Some(mut task) = tasks.pop_front() {
        if (task.condition)() {
            ready.push(task);
        } else {
            waiting.push_back(task);
        }
    }
    *tasks = waiting;
    ready
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn action_waits_for_its_condition() {
        let scheduler = TaskScheduler::start();
        let gate = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));

        let (g, r) = (Arc::clone(&gate), Arc::clone(&ran));
        scheduler
            .submit(Task::new(
                "gated",
                move || g.load(Ordering::SeqCst),
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ))
            .unwrap();

        thread::sleep(Duration::from_millis(60));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        gate.store(true, Ordering::SeqCst);
        scheduler.ping();
        wait_until(|| ran.load(Ordering::SeqCst) == 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn failing_action_stops_the_scheduler() {
        let scheduler = TaskScheduler::start();
        scheduler
            .submit(Task::new("boom", || true, || Err(OptsvaError::Protocol("boom".into()))))
            .unwrap();

        wait_until(|| scheduler.failure().is_some());
        assert!(matches!(scheduler.health(), Err(OptsvaError::SchedulerFailed(_))));
        let err = scheduler.submit(Task::new("late", || true, || Ok(()))).unwrap_err();
        assert!(matches!(err, OptsvaError::SchedulerFailed(_)));
    }

    #[test]
    fn shutdown_drops_unready_tasks() {
        let scheduler = TaskScheduler::start();
        scheduler.submit(Task::new("never", || false, || Ok(()))).unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
        assert!(matches!(
            scheduler.submit(Task::new("late", || true, || Ok(()))),
            Err(OptsvaError::ServiceStopped(_))
        ));
    }

    #[test]
    fn actions_may_submit_follow_up_work() {
        let scheduler = TaskScheduler::start();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner_scheduler = Arc::clone(&scheduler);
        let r = Arc::clone(&ran);
        scheduler
            .submit(Task::new("first", || true, move || {
                let r2 = Arc::clone(&r);
                r.fetch_add(1, Ordering::SeqCst);
                inner_scheduler.submit(Task::new("second", || true, move || {
                    r2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            }))
            .unwrap();
        wait_until(|| ran.load(Ordering::SeqCst) == 2);
    }
}
