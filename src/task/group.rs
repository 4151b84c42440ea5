use crate::exec::ExecutorRef;
use crate::task::{AsyncTask, status};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::ptr::NonNull;
use tracing::trace;

/// Most groups stay small; spill to the heap past this many live children.
const INLINE_CHILDREN: usize = 4;

/// Outcome of asking a group for its next completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPoll {
    /// A child completed; read its result or error through its future
    /// fragment.
    Ready(NonNull<AsyncTask>),
    /// No completion yet: the parent has been parked on the group and will
    /// be rescheduled by the next `offer`.
    Pending,
    /// Every child has completed and been consumed.
    Exhausted,
}

struct GroupState {
    /// Completions that have been offered but not yet consumed, in arrival
    /// order.
    pending: VecDeque<NonNull<AsyncTask>>,

    /// Children created into the group and not yet completed.
    children: SmallVec<[NonNull<AsyncTask>; INLINE_CHILDREN]>,

    /// The parent, when parked in `next()`.
    waiting_parent: Option<NonNull<AsyncTask>>,

    cancelled: bool,
}

/// A dynamic collection of child tasks whose completions are consumed in
/// arrival order.
///
/// Children are created with a group-child fragment pointing back here; when
/// such a child completes its future it offers itself to the group, which
/// either hands the completion to a parked parent or queues it for the next
/// `next()` call.
///
/// The group does not own its children's memory — task references do — it
/// only tracks which of them are outstanding.
pub struct TaskGroup {
    state: Mutex<GroupState>,
}

// Safety: all shared state is behind the mutex; raw task pointers are only
// handed back out to callers that own references to those tasks.
unsafe impl Send for TaskGroup {}
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    pub fn new() -> TaskGroup {
        TaskGroup {
            state: Mutex::new(GroupState {
                pending: VecDeque::new(),
                children: SmallVec::new(),
                waiting_parent: None,
                cancelled: false,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Number of children created and not yet consumed through `next()`.
    pub fn pending_children(&self) -> usize {
        let state = self.state.lock();
        state.children.len() + state.pending.len()
    }

    /// Registers a freshly created group child.
    ///
    /// Called during task allocation. Creating a child into a cancelled
    /// group immediately cancels the child; it still runs to a completion
    /// that `next()` will surface.
    pub(crate) fn on_child_created(&self, child: NonNull<AsyncTask>) {
        let cancelled = {
            let mut state = self.state.lock();
            state.children.push(child);
            state.cancelled
        };
        if cancelled {
            status::cancel(unsafe { child.as_ref() });
        }
    }

    /// Accepts the completion of `child` and surfaces it: directly to a
    /// parked parent if there is one, otherwise onto the pending queue.
    ///
    /// Called by the child itself while completing its future, before any
    /// of the future's waiters are resumed.
    pub(crate) fn offer(&self, child: NonNull<AsyncTask>, executor: ExecutorRef) {
        let parked = {
            let mut state = self.state.lock();
            if let Some(at) = state.children.iter().position(|c| *c == child) {
                state.children.swap_remove(at);
            }
            state.pending.push_back(child);
            state.waiting_parent.take()
        };

        trace!(
            child = unsafe { child.as_ref().id().as_u64() },
            resumed_parent = parked.is_some(),
            "group child offered"
        );

        if let Some(parent) = parked {
            // Safety: the parked parent committed its resume point before
            // parking, and owns a reference that outlives the park.
            unsafe { executor.enqueue(AsyncTask::as_job(parent)) };
        }
    }

    /// Returns the next completion, or parks `parent` until one arrives.
    ///
    /// # Safety
    ///
    /// Only the parent task may call this, with its resume point committed:
    /// a `Pending` return means the parent is suspended and will be enqueued
    /// by a later `offer`.
    pub unsafe fn next(&self, parent: NonNull<AsyncTask>) -> GroupPoll {
        let mut state = self.state.lock();
        if let Some(child) = state.pending.pop_front() {
            return GroupPoll::Ready(child);
        }
        if state.children.is_empty() {
            return GroupPoll::Exhausted;
        }
        debug_assert!(
            state.waiting_parent.is_none(),
            "a group can only park one parent"
        );
        state.waiting_parent = Some(parent);
        GroupPoll::Pending
    }

    /// Cancels every outstanding child and marks the group so later
    /// children are born cancelled. Completions still arrive and remain
    /// consumable; cancellation changes what they carry, not whether they
    /// happen.
    pub fn cancel_all(&self) {
        let children: SmallVec<[NonNull<AsyncTask>; INLINE_CHILDREN]> = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.children.clone()
        };

        trace!(outstanding = children.len(), "cancelling task group");
        for child in children {
            status::cancel(unsafe { child.as_ref() });
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
