//! A transaction-scoped job scheduler.
//!
//! Work that must run at most once per transaction context — chiefly the
//! `run` of a live query's dataflow graph — is enqueued here under a job id
//! and a list of dependency job ids. Flushing a context repeatedly runs the
//! jobs whose dependencies are no longer queued; a full pass that runs
//! nothing while jobs remain means the declared dependencies cannot be met
//! and is an error. Contexts are keyed by transaction id, with context 0
//! serving callers outside any transaction.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::trace;

use crate::errors::{Error, Result};

struct Job {
    id: String,
    deps: Vec<String>,
    run: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct Context {
    jobs: Vec<Job>,
    flushing: bool,
}

#[derive(Default)]
struct SchedulerState {
    contexts: HashMap<u64, Context>,
    clear_listeners: Vec<Box<dyn Fn(u64)>>,
}

thread_local! {
    static SCHEDULER: RefCell<SchedulerState> = RefCell::new(SchedulerState::default());
}

/// Enqueue a job in `context` unless one with the same id is already
/// queued; later requests coalesce into the first.
pub fn schedule(context: u64, id: &str, deps: Vec<String>, run: impl FnOnce() + 'static) {
    SCHEDULER.with(|scheduler| {
        let mut scheduler = scheduler.borrow_mut();
        let slot = scheduler.contexts.entry(context).or_default();
        if slot.jobs.iter().any(|job| job.id == id) {
            return;
        }
        slot.jobs.push(Job { id: id.to_string(), deps, run: Box::new(run) });
    });
}

/// True when `context` has queued jobs.
pub fn has_pending(context: u64) -> bool {
    SCHEDULER.with(|scheduler| {
        scheduler
            .borrow()
            .contexts
            .get(&context)
            .map(|slot| !slot.jobs.is_empty())
            .unwrap_or(false)
    })
}

/// Run every queued job in `context`, dependencies first.
///
/// A dependency blocks a job only while a job with that id is itself
/// queued; dependencies that never scheduled anything are vacuously met.
/// Jobs may schedule further jobs into the same context while running.
pub fn flush(context: u64) -> Result<()> {
    let entered = SCHEDULER.with(|scheduler| {
        let mut scheduler = scheduler.borrow_mut();
        let slot = scheduler.contexts.entry(context).or_default();
        if slot.flushing {
            return false;
        }
        slot.flushing = true;
        true
    });
    if !entered {
        // A nested flush folds into the outer one.
        return Ok(());
    }
    let result = flush_passes(context);
    SCHEDULER.with(|scheduler| {
        let mut scheduler = scheduler.borrow_mut();
        if let Some(slot) = scheduler.contexts.get_mut(&context) {
            slot.flushing = false;
            if slot.jobs.is_empty() {
                scheduler.contexts.remove(&context);
            }
        }
    });
    result
}

fn flush_passes(context: u64) -> Result<()> {
    loop {
        let runnable: Vec<Job> = SCHEDULER.with(|scheduler| {
            let mut scheduler = scheduler.borrow_mut();
            let Some(slot) = scheduler.contexts.get_mut(&context) else {
                return Vec::new();
            };
            let queued: Vec<String> = slot.jobs.iter().map(|job| job.id.clone()).collect();
            let mut ready = Vec::new();
            let mut blocked = Vec::new();
            for job in slot.jobs.drain(..) {
                let waiting = job.deps.iter().any(|dep| queued.contains(dep) && *dep != job.id);
                if waiting {
                    blocked.push(job);
                } else {
                    ready.push(job);
                }
            }
            slot.jobs = blocked;
            ready
        });

        if runnable.is_empty() {
            let remaining: Vec<String> = SCHEDULER.with(|scheduler| {
                scheduler
                    .borrow()
                    .contexts
                    .get(&context)
                    .map(|slot| slot.jobs.iter().map(|job| job.id.clone()).collect())
                    .unwrap_or_default()
            });
            if remaining.is_empty() {
                return Ok(());
            }
            return Err(Error::UnresolvedSchedulerDependency { context, missing: remaining });
        }
        trace!(context, jobs = runnable.len(), "scheduler pass");
        // Jobs run outside the scheduler borrow so they can enqueue more
        // work into this or other contexts.
        for job in runnable {
            (job.run)();
        }
    }
}

/// Abort `context`: drop its queued jobs and notify clear listeners.
pub fn clear(context: u64) {
    let listeners_to_run = SCHEDULER.with(|scheduler| {
        let mut scheduler = scheduler.borrow_mut();
        scheduler.contexts.remove(&context).is_some() && !scheduler.clear_listeners.is_empty()
    });
    if listeners_to_run {
        SCHEDULER.with(|scheduler| {
            let scheduler = scheduler.borrow();
            for listener in &scheduler.clear_listeners {
                listener(context);
            }
        });
    }
}

/// Register a listener invoked with the context id whenever a context is
/// cleared; used to release per-context resources.
pub fn on_clear(listener: impl Fn(u64) + 'static) {
    SCHEDULER.with(|scheduler| {
        scheduler.borrow_mut().clear_listeners.push(Box::new(listener));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dependencies_run_first() {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let a = Rc::clone(&order);
        let b = Rc::clone(&order);
        schedule(901, "child", vec!["parent".to_string()], move || a.borrow_mut().push("child"));
        schedule(901, "parent", vec![], move || b.borrow_mut().push("parent"));
        flush(901).unwrap();
        assert_eq!(*order.borrow(), vec!["parent", "child"]);
    }

    #[test]
    fn duplicate_job_ids_coalesce() {
        let runs = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let counter = Rc::clone(&runs);
            schedule(902, "only-once", vec![], move || *counter.borrow_mut() += 1);
        }
        flush(902).unwrap();
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn jobs_may_schedule_more_jobs() {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let outer = Rc::clone(&order);
        schedule(903, "first", vec![], move || {
            outer.borrow_mut().push("first");
            let inner = Rc::clone(&outer);
            schedule(903, "second", vec![], move || inner.borrow_mut().push("second"));
        });
        flush(903).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn circular_dependencies_error() {
        schedule(904, "a", vec!["b".to_string()], || {});
        schedule(904, "b", vec!["a".to_string()], || {});
        let err = flush(904).unwrap_err();
        assert!(matches!(err, Error::UnresolvedSchedulerDependency { context: 904, .. }));
        clear(904);
    }

    #[test]
    fn clear_notifies_listeners() {
        let cleared = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&cleared);
        on_clear(move |context| captured.borrow_mut().push(context));
        schedule(905, "job", vec![], || {});
        clear(905);
        assert!(cleared.borrow().contains(&905));
    }
}
