use crate::exec::ExecutorRef;
use crate::task::Job;
use std::cell::Cell;
use std::ptr::NonNull;

thread_local! {
    static CURRENT_EXECUTOR: Cell<Option<ExecutorRef>> = const { Cell::new(None) };
}

/// Returns the executor the current thread is running on, if any.
pub fn current_executor() -> Option<ExecutorRef> {
    CURRENT_EXECUTOR.with(Cell::get)
}

/// Set and restore the current executor around a job execution.
///
/// A thread counts as "fully established" on an executor only while one of
/// these guards is live for it.
pub struct ExecutorGuard {
    prev: Option<ExecutorRef>,
}

impl ExecutorGuard {
    pub fn enter(executor: ExecutorRef) -> Self {
        ExecutorGuard {
            prev: CURRENT_EXECUTOR.with(|c| c.replace(Some(executor))),
        }
    }
}

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        CURRENT_EXECUTOR.with(|c| c.set(self.prev));
    }
}

/// Establishes `executor` as current on this thread and runs `job`.
///
/// This is the entry point executors are expected to call from their worker
/// loops; it is what makes [`Job::run_in_fully_established_context`] legal to
/// invoke.
///
/// # Safety
///
/// `job` must point at a live job the caller has scheduling ownership of, and
/// must not be run again afterwards.
pub unsafe fn run_job(job: NonNull<Job>, executor: ExecutorRef) {
    let _guard = ExecutorGuard::enter(executor);
    unsafe { Job::run_in_fully_established_context(job, executor) }
}
