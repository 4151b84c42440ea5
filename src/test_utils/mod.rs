//! Mock executors and task scaffolding shared by the unit tests.

use crate::exec::{ExecutorRef, RawExecutor};
use crate::task::{AsyncContext, AsyncTask, Job, TaskGroup, TaskId};
use parking_lot::Mutex;
use std::ptr::NonNull;

// Exports
pub(crate) mod harness;
pub(crate) use harness::TaskHarness;

/// A resume entrypoint that does nothing; stands in for generated code.
pub(crate) unsafe fn noop_resume(
    _task: NonNull<AsyncTask>,
    _executor: ExecutorRef,
    _context: *mut AsyncContext,
) {
}

/// An executor that drops every job on the floor. Only good for providing
/// executor identities.
///
/// Carries a byte so each leaked instance gets its own address; a
/// zero-sized struct would let the allocator hand back the same pointer
/// for every instance, collapsing distinct identities into one.
pub(crate) struct NoopExecutor(u8);

impl RawExecutor for NoopExecutor {
    unsafe fn enqueue(&self, _job: NonNull<Job>) {}
}

impl NoopExecutor {
    /// A fresh, distinct executor identity.
    pub(crate) fn leaked() -> ExecutorRef {
        ExecutorRef::from_executor(Box::leak(Box::new(NoopExecutor(0))))
    }
}

/// An executor that records which tasks were enqueued, in order, without
/// running anything.
pub(crate) struct RecordingExecutor {
    order: Mutex<Vec<TaskId>>,
}

impl RawExecutor for RecordingExecutor {
    unsafe fn enqueue(&self, job: NonNull<Job>) {
        let task = unsafe { AsyncTask::from_job(job) };
        self.order.lock().push(unsafe { task.as_ref() }.id());
    }
}

impl RecordingExecutor {
    pub(crate) fn leaked() -> &'static RecordingExecutor {
        Box::leak(Box::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn executor(&'static self) -> ExecutorRef {
        ExecutorRef::from_executor(self)
    }

    /// Takes the recorded enqueue order.
    pub(crate) fn drain(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.order.lock())
    }
}

/// Stable identity pointers usable as task-local keys.
pub(crate) fn local_key(index: usize) -> NonNull<()> {
    static KEYS: [u8; 16] = [0; 16];
    NonNull::from(&KEYS[index]).cast()
}

/// A leaked task group, for tests that thread raw group pointers through
/// task fragments.
pub(crate) fn leaked_group() -> &'static TaskGroup {
    Box::leak(Box::new(TaskGroup::new()))
}
