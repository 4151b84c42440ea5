#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::ExecutorRef;
use crate::task::flags::{ContextFlags, ContextKind};
use crate::task::job::TaskResumeFn;
use crate::task::{AsyncTask, TaskErrorBox};
use std::ptr::NonNull;

/// An activation record of a suspendable computation.
///
/// Contexts form a singly linked chain rooted at the task's resume context;
/// the root's `parent` is null. They are usually carved out of the task's
/// stack allocator, but nothing requires that: a caller-frame record works
/// just as well.
///
/// It is critical for `AsyncContext` to be the first field of every extended
/// context below, so a context pointer can be read at either type.
#[repr(C, align(16))]
pub struct AsyncContext {
    /// The next-older activation record; null for the root.
    pub parent: *mut AsyncContext,

    /// Continuation to invoke to resume running in the parent record.
    pub resume_parent: TaskResumeFn,

    /// The executor the parent wants to be resumed on.
    pub resume_parent_executor: ExecutorRef,

    pub flags: ContextFlags,
}

// Safety: a context is only ever mutated by the thread currently running its
// task; it crosses threads whenever the task migrates executors.
unsafe impl Send for AsyncContext {}
unsafe impl Sync for AsyncContext {}

impl AsyncContext {
    pub fn new(
        flags: ContextFlags,
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        parent: *mut AsyncContext,
    ) -> AsyncContext {
        AsyncContext {
            parent,
            resume_parent,
            resume_parent_executor,
            flags,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.flags.kind()
    }

    /// Performs a return from this context.
    ///
    /// Installs the parent record and its continuation as the task's resume
    /// point, then either continues inline — when the parent wants the
    /// executor the task is already running on — or enqueues the task on the
    /// parent's preferred executor. The inline path is the common one; the
    /// hop is elided exactly when `resume_parent_executor == current_executor`.
    ///
    /// # Safety
    ///
    /// `this` must be the task's current resume context, `task` the task it
    /// belongs to, and the current thread must be established on
    /// `current_executor`.
    pub unsafe fn resume_parent(
        this: NonNull<AsyncContext>,
        task: NonNull<AsyncTask>,
        current_executor: ExecutorRef,
    ) {
        let ctx = this.as_ref();
        let parent = ctx.parent;
        let resume = ctx.resume_parent;
        let target = ctx.resume_parent_executor;

        task.as_ref().commit_resume_point(resume, parent);

        if target == current_executor {
            resume(task, current_executor, parent)
        } else {
            target.enqueue(AsyncTask::as_job(task))
        }
    }
}

/// An activation record that can also yield to its parent without
/// returning.
///
/// After the parent resumes through `yield_to_parent`, control may later
/// re-enter this record at whatever resume function was last installed.
#[repr(C, align(16))]
pub struct YieldingAsyncContext {
    pub base: AsyncContext,

    /// Continuation to invoke to temporarily resume the parent.
    pub yield_to_parent: TaskResumeFn,

    /// The executor the parent wants to be yielded to on.
    pub yield_to_parent_executor: ExecutorRef,
}

unsafe impl Send for YieldingAsyncContext {}
unsafe impl Sync for YieldingAsyncContext {}

impl YieldingAsyncContext {
    pub fn new(
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        yield_to_parent: TaskResumeFn,
        yield_to_parent_executor: ExecutorRef,
        parent: *mut AsyncContext,
    ) -> YieldingAsyncContext {
        YieldingAsyncContext {
            base: AsyncContext::new(
                ContextFlags::new(ContextKind::Yielding),
                resume_parent,
                resume_parent_executor,
                parent,
            ),
            yield_to_parent,
            yield_to_parent_executor,
        }
    }

    /// Downcasts a context known to be yielding.
    ///
    /// # Safety
    ///
    /// `ctx` must point at a live context.
    pub unsafe fn from_context(ctx: NonNull<AsyncContext>) -> NonNull<YieldingAsyncContext> {
        assert_eq!(ctx.as_ref().kind(), ContextKind::Yielding);
        ctx.cast()
    }

    /// Suspends this record and resumes the parent, without returning.
    ///
    /// The record stays the task's resume context: `resume` is committed as
    /// the re-entry point for when the parent hands control back.
    ///
    /// # Safety
    ///
    /// Same contract as [`AsyncContext::resume_parent`]; additionally
    /// `resume` must be a valid re-entry point for this record.
    pub unsafe fn yield_to_parent(
        this: NonNull<YieldingAsyncContext>,
        task: NonNull<AsyncTask>,
        current_executor: ExecutorRef,
        resume: TaskResumeFn,
    ) {
        let ctx = this.as_ref();
        task.as_ref()
            .commit_resume_point(resume, this.cast().as_ptr());

        let target = ctx.yield_to_parent_executor;
        if target == current_executor {
            (ctx.yield_to_parent)(task, current_executor, ctx.base.parent)
        } else {
            target.enqueue(AsyncTask::as_job(task))
        }
    }
}

/// The root activation record of a future task.
///
/// Matches the shape of a computation producing one result or error: the
/// indirect result slot points at the future fragment's trailing storage and
/// the error slot at its error field, so completing the future only has to
/// inspect them.
#[repr(C, align(16))]
pub struct FutureAsyncContext {
    pub base: AsyncContext,

    /// Where a thrown error is stored; points into the future fragment.
    pub error_result: *mut Option<TaskErrorBox>,

    /// Where the result value is written; points into the future fragment.
    pub indirect_result: *mut (),
}

unsafe impl Send for FutureAsyncContext {}
unsafe impl Sync for FutureAsyncContext {}

impl FutureAsyncContext {
    pub fn new(
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        parent: *mut AsyncContext,
        error_result: *mut Option<TaskErrorBox>,
        indirect_result: *mut (),
    ) -> FutureAsyncContext {
        FutureAsyncContext {
            base: AsyncContext::new(
                ContextFlags::new(ContextKind::FutureRoot),
                resume_parent,
                resume_parent_executor,
                parent,
            ),
            error_result,
            indirect_result,
        }
    }

    /// Downcasts a context known to be a future root (plain or closure).
    ///
    /// # Safety
    ///
    /// `ctx` must point at a live context.
    pub unsafe fn from_context(ctx: NonNull<AsyncContext>) -> NonNull<FutureAsyncContext> {
        let kind = ctx.as_ref().kind();
        assert!(
            matches!(kind, ContextKind::FutureRoot | ContextKind::FutureClosure),
            "context is not a future root: {kind:?}"
        );
        ctx.cast()
    }
}

/// A future root context that was started with a closure object; keeps the
/// captured object alive for the duration of the task body.
#[repr(C, align(16))]
pub struct FutureClosureAsyncContext {
    pub future: FutureAsyncContext,

    /// The captured closure object, type-erased.
    pub closure_context: *mut (),
}

unsafe impl Send for FutureClosureAsyncContext {}
unsafe impl Sync for FutureClosureAsyncContext {}

impl FutureClosureAsyncContext {
    pub fn new(
        resume_parent: TaskResumeFn,
        resume_parent_executor: ExecutorRef,
        parent: *mut AsyncContext,
        error_result: *mut Option<TaskErrorBox>,
        indirect_result: *mut (),
        closure_context: *mut (),
    ) -> FutureClosureAsyncContext {
        let mut future = FutureAsyncContext::new(
            resume_parent,
            resume_parent_executor,
            parent,
            error_result,
            indirect_result,
        );
        future.base.flags = ContextFlags::new(ContextKind::FutureClosure);
        FutureClosureAsyncContext {
            future,
            closure_context,
        }
    }
}
