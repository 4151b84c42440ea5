#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::ExecutorRef;
use crate::task::context::FutureAsyncContext;
use crate::task::fragment::{FutureStatus, WaitQueueItem};
use crate::task::job::NEXT_WAITING_TASK_INDEX;
use crate::task::{AsyncContext, AsyncTask};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::trace;

impl AsyncTask {
    /// Waits for this future task to complete.
    ///
    /// Returns the status of the future. `Executing` means `waiting_task`
    /// has been added to the wait queue and will be scheduled when the
    /// future completes; the waiter must have committed its resume point
    /// before calling, because control may transfer at any moment after the
    /// registration succeeds. Any other status means the future already
    /// completed and its result or error can be read directly.
    ///
    /// # Safety
    ///
    /// `self` must carry a future fragment; `waiting_task` must be a live
    /// task that is currently suspended (its resume context committed) and
    /// not queued anywhere else.
    pub unsafe fn wait_future(&self, waiting_task: NonNull<AsyncTask>) -> FutureStatus {
        let fragment = self.future_fragment();
        debug_assert!(
            !waiting_task
                .as_ref()
                .resume_context_ptr()
                .is_null(),
            "waiter has no committed resume point"
        );

        let mut current = fragment.wait_queue.load(Ordering::Acquire);
        loop {
            let observed = WaitQueueItem::from_raw(current);
            match observed.status() {
                FutureStatus::Executing => {
                    // Push at head: the queue is LIFO by construction.
                    waiting_task.as_ref().job().set_scheduler_private(
                        NEXT_WAITING_TASK_INDEX,
                        observed.head().cast(),
                    );
                    let next =
                        WaitQueueItem::pack(FutureStatus::Executing, waiting_task.as_ptr());
                    match fragment.wait_queue.compare_exchange_weak(
                        current,
                        next.raw(),
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return FutureStatus::Executing,
                        Err(now) => current = now,
                    }
                }
                status => return status,
            }
        }
    }

    /// Completes this future task.
    ///
    /// The result value (or error) has already been staged through the
    /// slots of `context`, which point into the future fragment. The wait
    /// queue transitions exactly once; every waiter registered before the
    /// transition is handed to `executor`, most recent registration first.
    /// If the task is a group child, its completion is offered to the group
    /// before any waiter runs.
    ///
    /// Completing a future twice is a hard programmer error.
    ///
    /// # Safety
    ///
    /// `self` must carry a future fragment and `context` must be its future
    /// root context; only the task itself, at its completion point, may
    /// call this.
    pub unsafe fn complete_future(&self, context: NonNull<AsyncContext>, executor: ExecutorRef) {
        let fragment = self.future_fragment();
        let _ = FutureAsyncContext::from_context(context);

        // An error staged in the fragment decides the terminal status.
        let status = if (*fragment.error.get()).is_some() {
            FutureStatus::Error
        } else {
            FutureStatus::Success
        };

        let mut current = fragment.wait_queue.load(Ordering::Acquire);
        let head = loop {
            let observed = WaitQueueItem::from_raw(current);
            assert_eq!(
                observed.status(),
                FutureStatus::Executing,
                "future completed twice"
            );
            let next = WaitQueueItem::pack(status, std::ptr::null_mut());
            match fragment.wait_queue.compare_exchange_weak(
                current,
                next.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break observed.head(),
                Err(now) => current = now,
            }
        };

        trace!(
            task = self.id().as_u64(),
            ?status,
            "future completed"
        );

        if self.job().flags().is_group_child() {
            let group = self.group_child_fragment().group();
            group.as_ref().offer(NonNull::from(self), executor);
        }

        // Walk the detached list; head was the most recent registration, so
        // enqueue order is LIFO relative to registration. Fairness is
        // explicitly not promised.
        let mut waiter = head;
        while !waiter.is_null() {
            let next = (*waiter)
                .job()
                .scheduler_private(NEXT_WAITING_TASK_INDEX)
                .cast::<AsyncTask>();
            (*waiter)
                .job()
                .set_scheduler_private(NEXT_WAITING_TASK_INDEX, std::ptr::null_mut());
            executor.enqueue(AsyncTask::as_job(NonNull::new_unchecked(waiter)));
            waiter = next;
        }
    }

    /// Reads the completed result value.
    ///
    /// # Safety
    ///
    /// The future must have completed with `Success`, and `T` must be the
    /// type the fragment's witness describes.
    pub unsafe fn future_result<T>(&self) -> &T {
        let fragment = self.future_fragment();
        let witness = fragment.result_witness();
        debug_assert_eq!(std::mem::size_of::<T>(), witness.size);
        debug_assert_eq!(std::mem::align_of::<T>(), witness.align);
        &*fragment.storage_ptr().cast::<T>()
    }
}
