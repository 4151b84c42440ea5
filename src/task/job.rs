#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::ExecutorRef;
use crate::task::flags::{JobFlags, Priority};
use crate::task::{AsyncContext, AsyncTask};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

/// Entrypoint of a simple (non-task) job.
pub type JobInvokeFn = unsafe fn(NonNull<Job>, ExecutorRef);

/// Entrypoint resuming an async task at its current activation record.
pub type TaskResumeFn = unsafe fn(NonNull<AsyncTask>, ExecutorRef, *mut AsyncContext);

// Index into `scheduler_private`, for use by the runtime itself.
//
// While a task is queued on a future, the first scheduler-private word holds
// the next waiting task of that future's wait list.
pub(crate) const NEXT_WAITING_TASK_INDEX: usize = 0;

/// One indirect branch is enough when resuming a task, so the two entrypoint
/// flavors share a slot; `JobFlags::IS_ASYNC_TASK` discriminates.
#[derive(Clone, Copy)]
union JobEntry {
    run_job: JobInvokeFn,
    resume_task: TaskResumeFn,
}

/// A schedulable job: the minimal unit an executor knows how to run.
///
/// The layout is part of the ABI: two scheduler-private machine words, the
/// flags word, and the entrypoint — four machine words total, aligned to
/// twice the word alignment.
#[repr(C, align(16))]
pub struct Job {
    /// Reserved for the use of the scheduler; opaque to the job itself.
    scheduler_private: [UnsafeCell<*mut ()>; 2],

    flags: JobFlags,

    /// Rewritten at suspension points to install the next resume point.
    entry: UnsafeCell<JobEntry>,
}

static_assertions::const_assert_eq!(mem::size_of::<Job>(), 4 * mem::size_of::<usize>());
static_assertions::const_assert_eq!(mem::align_of::<Job>(), 2 * mem::align_of::<usize>());

// Safety: the scheduler-private words are only touched by whichever executor
// or wait queue currently owns the job for scheduling.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    /// Creates a simple job. Panics if `flags` claim an async task.
    pub fn new_simple(flags: JobFlags, run: JobInvokeFn) -> Job {
        assert!(!flags.is_async_task(), "wrong constructor for a task");
        Job {
            scheduler_private: [
                UnsafeCell::new(ptr::null_mut()),
                UnsafeCell::new(ptr::null_mut()),
            ],
            flags,
            entry: UnsafeCell::new(JobEntry { run_job: run }),
        }
    }

    /// Creates the job header of an async task. Panics if `flags` do not
    /// claim one.
    pub(crate) fn new_task(flags: JobFlags, resume: TaskResumeFn) -> Job {
        assert!(flags.is_async_task(), "wrong constructor for a non-task job");
        Job {
            scheduler_private: [
                UnsafeCell::new(ptr::null_mut()),
                UnsafeCell::new(ptr::null_mut()),
            ],
            flags,
            entry: UnsafeCell::new(JobEntry { resume_task: resume }),
        }
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn priority(&self) -> Priority {
        self.flags.priority()
    }

    pub fn is_async_task(&self) -> bool {
        self.flags.is_async_task()
    }

    /// Starts running this job, given that the current thread has already
    /// been fully established on `current_executor`.
    ///
    /// Establish the context by going through [`crate::exec::run_job`].
    ///
    /// # Safety
    ///
    /// `this` must be live and owned-for-execution by the caller, and the
    /// current-executor slot of this thread must be `current_executor`.
    pub unsafe fn run_in_fully_established_context(
        this: NonNull<Job>,
        current_executor: ExecutorRef,
    ) {
        if this.as_ref().is_async_task() {
            AsyncTask::run_in_fully_established_context(AsyncTask::from_job(this), current_executor)
        } else {
            let run = (*this.as_ref().entry.get()).run_job;
            run(this, current_executor)
        }
    }

    /// The task resume entrypoint. Panics if this job is not a task.
    pub(crate) fn resume_entry(&self) -> TaskResumeFn {
        assert!(self.is_async_task());
        unsafe { (*self.entry.get()).resume_task }
    }

    /// # Safety
    ///
    /// Only the thread currently running the task may install resume points,
    /// and the job must not be schedulable while it does.
    pub(crate) unsafe fn set_resume_entry(&self, resume: TaskResumeFn) {
        debug_assert!(self.is_async_task());
        self.entry.get().write(JobEntry { resume_task: resume });
    }

    pub(crate) unsafe fn scheduler_private(&self, index: usize) -> *mut () {
        *self.scheduler_private[index].get()
    }

    pub(crate) unsafe fn set_scheduler_private(&self, index: usize, value: *mut ()) {
        *self.scheduler_private[index].get() = value;
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("flags", &self.flags)
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}
