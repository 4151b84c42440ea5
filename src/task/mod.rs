//! The task object model: schedulable jobs, async tasks and their trailing
//! fragments, activation records, task-local values, the cancellation record
//! chain, futures, and task groups.

// Public API
mod flags;
pub use self::flags::{ContextFlags, ContextKind, JobFlags, Priority};

mod job;
pub use self::job::{Job, JobInvokeFn, TaskResumeFn};

mod context;
pub use self::context::{
    AsyncContext, FutureAsyncContext, FutureClosureAsyncContext, YieldingAsyncContext,
};

mod fragment;
pub use self::fragment::{ChildFragment, FutureFragment, FutureStatus, GroupChildFragment};

mod group;
pub use self::group::{GroupPoll, TaskGroup};

mod id;
pub use self::id::TaskId;

mod local;
pub use self::local::{TaskLocalInheritance, TaskLocalStorage};

mod status;
pub use self::status::{
    CancellationHandlerRecord, ChildTaskStatusRecord, RecordKind, TaskGroupRecord,
    TaskStatusRecord, cancel, pop_status_record, push_status_record,
};

#[allow(clippy::module_inception)]
mod task;
pub use self::task::{AsyncTask, TaskBuilder, TaskRef};

mod witness;
pub use self::witness::{ValueWitness, witness_of};

// Exports
pub(crate) mod alloc;

mod future;

#[cfg(test)]
mod tests;

/// An uninterpreted error payload carried by a future that completed in the
/// error state. The core moves it around; consumers decide what it means.
pub type TaskErrorBox = Box<dyn std::error::Error + Send>;
