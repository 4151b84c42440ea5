use crate::task::Job;
use std::fmt;
use std::ptr::NonNull;

// Public API
mod current;
pub use current::{ExecutorGuard, current_executor, run_job};

/// Table of function pointers backing an [`ExecutorRef`].
///
/// Kept deliberately tiny: the core only ever asks an executor to take
/// ownership of a job for scheduling.
pub struct ExecutorVtable {
    /// Enqueue a job. The executor must eventually invoke
    /// [`Job::run_in_fully_established_context`] on a thread whose
    /// current-executor slot has been set to this executor, e.g. via
    /// [`run_job`].
    pub enqueue: unsafe fn(NonNull<()>, NonNull<Job>),
}

/// An opaque reference to an executor.
///
/// Two references are equal iff they identify the same executor; the core
/// relies on this to elide executor hops. The identity pointer is never
/// dereferenced by the core, only handed back through the vtable.
#[derive(Clone, Copy)]
pub struct ExecutorRef {
    identity: NonNull<()>,
    vtable: &'static ExecutorVtable,
}

// Safety: the reference itself is inert data; all uses go through the
// vtable, whose implementations must be thread-safe per the `RawExecutor`
// bound below.
unsafe impl Send for ExecutorRef {}
unsafe impl Sync for ExecutorRef {}

impl ExecutorRef {
    /// Builds a reference from a raw identity pointer and vtable.
    ///
    /// # Safety
    ///
    /// `identity` must remain valid for as long as jobs can be enqueued
    /// through the returned reference.
    pub unsafe fn from_raw(identity: NonNull<()>, vtable: &'static ExecutorVtable) -> ExecutorRef {
        ExecutorRef { identity, vtable }
    }

    /// Builds a reference backed by a Rust executor type.
    pub fn from_executor<E: RawExecutor>(executor: &'static E) -> ExecutorRef {
        ExecutorRef {
            identity: NonNull::from(executor).cast(),
            vtable: vtable::<E>(),
        }
    }

    /// Hands `job` to the executor for scheduling.
    ///
    /// # Safety
    ///
    /// The caller transfers its permission to resume the job; `job` must stay
    /// allocated until the executor has run it.
    pub unsafe fn enqueue(self, job: NonNull<Job>) {
        unsafe { (self.vtable.enqueue)(self.identity, job) }
    }
}

impl PartialEq for ExecutorRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for ExecutorRef {}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutorRef({:p})", self.identity.as_ptr())
    }
}

/// Trait implemented by Rust-typed executors that want to hand out
/// [`ExecutorRef`]s pointing at themselves.
pub trait RawExecutor: Sync {
    /// Take ownership of `job` for scheduling.
    ///
    /// # Safety
    ///
    /// `job` points at a live job; the implementation must run it exactly
    /// once, on a thread where it has established itself as current.
    unsafe fn enqueue(&self, job: NonNull<Job>);
}

/// Get the vtable for the requested executor type.
fn vtable<E: RawExecutor>() -> &'static ExecutorVtable {
    &ExecutorVtable {
        enqueue: enqueue::<E>,
    }
}

unsafe fn enqueue<E: RawExecutor>(identity: NonNull<()>, job: NonNull<Job>) {
    unsafe { identity.cast::<E>().as_ref().enqueue(job) }
}
