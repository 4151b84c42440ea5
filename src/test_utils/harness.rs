//! Builds fully formed tasks with their root activation records, so tests
//! can exercise the runtime protocols without a code generator.

use crate::exec::ExecutorRef;
use crate::task::{
    AsyncContext, AsyncTask, ContextFlags, FutureAsyncContext, TaskBuilder, TaskErrorBox,
    TaskGroup, TaskId, TaskRef,
};
use crate::test_utils::{NoopExecutor, noop_resume};
use std::ptr::{self, NonNull};

enum RootContext {
    // Held only to pin the allocation the task's resume pointer targets.
    Plain(#[allow(dead_code)] Box<AsyncContext>),
    Future(Box<FutureAsyncContext>),
}

/// A task plus its heap-pinned root context.
///
/// The context is committed as the task's resume point, which is the state
/// every suspension-related protocol expects a task to be in.
pub(crate) struct TaskHarness {
    task: TaskRef,
    context: RootContext,
}

impl TaskHarness {
    /// A task with no fragments, parked on a plain root context.
    pub(crate) fn plain() -> TaskHarness {
        let task = unsafe { TaskBuilder::new().build(noop_resume, ptr::null_mut()) };
        Self::with_plain_context(task)
    }

    /// A child of `parent`'s task.
    pub(crate) fn child_of(parent: &TaskHarness) -> TaskHarness {
        let task = unsafe {
            TaskBuilder::new()
                .child_of(parent.raw())
                .build(noop_resume, ptr::null_mut())
        };
        Self::with_plain_context(task)
    }

    /// A future task with trailing storage for a `T`.
    pub(crate) fn future<T>() -> TaskHarness {
        let task = unsafe { TaskBuilder::new().future::<T>().build(noop_resume, ptr::null_mut()) };
        Self::with_future_context(task)
    }

    /// A future task offering its completion to `group`.
    pub(crate) fn group_child<T>(group: &'static TaskGroup) -> TaskHarness {
        let task = unsafe {
            TaskBuilder::new()
                .group_child(NonNull::from(group))
                .future::<T>()
                .build(noop_resume, ptr::null_mut())
        };
        Self::with_future_context(task)
    }

    /// A child of `parent` that is also a group child and future, the full
    /// structured-concurrency shape.
    pub(crate) fn structured_child<T>(
        parent: &TaskHarness,
        group: &'static TaskGroup,
    ) -> TaskHarness {
        let task = unsafe {
            TaskBuilder::new()
                .child_of(parent.raw())
                .group_child(NonNull::from(group))
                .future::<T>()
                .build(noop_resume, ptr::null_mut())
        };
        Self::with_future_context(task)
    }

    fn with_plain_context(task: TaskRef) -> TaskHarness {
        let context = Box::new(AsyncContext::new(
            ContextFlags::default(),
            noop_resume,
            NoopExecutor::leaked(),
            ptr::null_mut(),
        ));
        unsafe {
            task.commit_resume_point(noop_resume, ptr::from_ref(&*context).cast_mut());
        }
        TaskHarness {
            task,
            context: RootContext::Plain(context),
        }
    }

    fn with_future_context(task: TaskRef) -> TaskHarness {
        let fragment = task.future_fragment();
        let context = Box::new(FutureAsyncContext::new(
            noop_resume,
            NoopExecutor::leaked(),
            ptr::null_mut(),
            fragment.error.get(),
            fragment.storage_ptr(),
        ));
        unsafe {
            task.commit_resume_point(noop_resume, ptr::from_ref(&context.base).cast_mut());
        }
        TaskHarness {
            task,
            context: RootContext::Future(context),
        }
    }

    pub(crate) fn task(&self) -> &AsyncTask {
        &self.task
    }

    pub(crate) fn task_ref(&self) -> &TaskRef {
        &self.task
    }

    pub(crate) fn raw(&self) -> NonNull<AsyncTask> {
        self.task.raw()
    }

    pub(crate) fn id(&self) -> TaskId {
        self.task.id()
    }

    fn future_context(&self) -> &FutureAsyncContext {
        match &self.context {
            RootContext::Future(context) => context,
            RootContext::Plain(_) => panic!("harness task is not a future"),
        }
    }

    /// Writes the future's result value into its trailing storage, as the
    /// task body would through the context's indirect result slot.
    ///
    /// # Safety
    ///
    /// `T` must be the result type the task was built with, and the future
    /// must not have completed yet.
    pub(crate) unsafe fn stage_result<T>(&self, value: T) {
        let context = self.future_context();
        unsafe { context.indirect_result.cast::<T>().write(value) }
    }

    /// Stages an error completion through the context's error slot.
    ///
    /// # Safety
    ///
    /// The future must not have completed yet.
    pub(crate) unsafe fn stage_error(&self, error: TaskErrorBox) {
        let context = self.future_context();
        unsafe { *context.error_result = Some(error) }
    }

    /// Completes the future, resuming waiters on `executor`.
    ///
    /// # Safety
    ///
    /// A result or error must have been staged; completing twice is a
    /// programmer error by design.
    pub(crate) unsafe fn complete(&self, executor: ExecutorRef) {
        let context = NonNull::from(&self.future_context().base);
        unsafe { self.task.complete_future(context, executor) }
    }
}
