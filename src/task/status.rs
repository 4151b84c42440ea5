#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::{AsyncTask, TaskGroup};
use std::cell::UnsafeCell;
use std::hint;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

const IS_CANCELLED: usize = 0b01;
const IS_LOCKED: usize = 0b10;
const RECORD_MASK: usize = !(IS_CANCELLED | IS_LOCKED);

/// One observed value of a task's status word: the innermost status record
/// with the cancelled and locked bits folded into its low two bits. Records
/// are at least 4-byte aligned, so the bits are always free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveTaskStatus(usize);

impl ActiveTaskStatus {
    pub(crate) const fn initial() -> ActiveTaskStatus {
        ActiveTaskStatus(0)
    }

    fn pack(record: *mut TaskStatusRecord, cancelled: bool, locked: bool) -> ActiveTaskStatus {
        debug_assert_eq!(record as usize & !RECORD_MASK, 0);
        ActiveTaskStatus(
            record as usize
                | if cancelled { IS_CANCELLED } else { 0 }
                | if locked { IS_LOCKED } else { 0 },
        )
    }

    pub(crate) fn from_raw(raw: usize) -> ActiveTaskStatus {
        ActiveTaskStatus(raw)
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }

    pub(crate) fn is_cancelled(self) -> bool {
        self.0 & IS_CANCELLED != 0
    }

    pub(crate) fn is_locked(self) -> bool {
        self.0 & IS_LOCKED != 0
    }

    /// The innermost status record. Code running asynchronously with the
    /// task must not follow this without holding the lock bit.
    pub(crate) fn innermost_record(self) -> *mut TaskStatusRecord {
        (self.0 & RECORD_MASK) as *mut TaskStatusRecord
    }
}

/// Discriminates the concrete status records threaded through a task's
/// status word.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Anchors a list of child tasks.
    ChildTask = 0,
    /// Links the task to a task group it owns.
    TaskGroup = 1,
    /// Runs a callback when the task is cancelled.
    CancellationHandler = 2,
}

/// Common header of every status record.
///
/// Records form a singly linked list anchored at the task's status word;
/// `parent` points at the next-older record. They are pushed on entry to a
/// scoped construct and popped on exit, in strictly LIFO order.
#[repr(C, align(4))]
pub struct TaskStatusRecord {
    kind: RecordKind,
    parent: UnsafeCell<*mut TaskStatusRecord>,
}

// Safety: the chain is only mutated under the status-word lock bit.
unsafe impl Send for TaskStatusRecord {}
unsafe impl Sync for TaskStatusRecord {}

impl TaskStatusRecord {
    fn new(kind: RecordKind) -> TaskStatusRecord {
        TaskStatusRecord {
            kind,
            parent: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// The next-older record, or null.
    ///
    /// # Safety
    ///
    /// Requires the status-word lock, or being the task itself reading its
    /// own chain.
    pub unsafe fn parent(&self) -> *mut TaskStatusRecord {
        *self.parent.get()
    }
}

/// Anchors the singly linked list of a task's structured child tasks. The
/// list is threaded through each child's child fragment and may only be
/// touched by the parent.
#[repr(C)]
pub struct ChildTaskStatusRecord {
    base: TaskStatusRecord,
    first_child: UnsafeCell<*mut AsyncTask>,
}

unsafe impl Send for ChildTaskStatusRecord {}
unsafe impl Sync for ChildTaskStatusRecord {}

impl ChildTaskStatusRecord {
    pub fn new() -> ChildTaskStatusRecord {
        ChildTaskStatusRecord {
            base: TaskStatusRecord::new(RecordKind::ChildTask),
            first_child: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    pub fn as_record(&self) -> NonNull<TaskStatusRecord> {
        NonNull::from(&self.base)
    }

    /// Links `child` at the head of the list.
    ///
    /// # Safety
    ///
    /// Only the parent task may link children, and `child` must carry a
    /// child fragment naming it as parent.
    pub unsafe fn add_child(&self, child: NonNull<AsyncTask>) {
        let fragment = child.as_ref().child_fragment();
        debug_assert!(fragment.next_child().is_null());
        fragment.set_next_child(*self.first_child.get());
        *self.first_child.get() = child.as_ptr();
    }

    /// # Safety
    ///
    /// Only the parent task may traverse the list.
    pub unsafe fn first_child(&self) -> *mut AsyncTask {
        *self.first_child.get()
    }
}

impl Default for ChildTaskStatusRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Links a task to a task group it owns, so cancellation can reach the
/// group's outstanding children.
#[repr(C)]
pub struct TaskGroupRecord {
    base: TaskStatusRecord,
    group: NonNull<TaskGroup>,
}

unsafe impl Send for TaskGroupRecord {}
unsafe impl Sync for TaskGroupRecord {}

impl TaskGroupRecord {
    pub fn new(group: NonNull<TaskGroup>) -> TaskGroupRecord {
        TaskGroupRecord {
            base: TaskStatusRecord::new(RecordKind::TaskGroup),
            group,
        }
    }

    pub fn as_record(&self) -> NonNull<TaskStatusRecord> {
        NonNull::from(&self.base)
    }

    pub fn group(&self) -> NonNull<TaskGroup> {
        self.group
    }
}

/// Runs a callback when the task is cancelled while the record is pushed.
#[repr(C)]
pub struct CancellationHandlerRecord {
    base: TaskStatusRecord,
    handler: unsafe fn(*mut ()),
    argument: *mut (),
}

unsafe impl Send for CancellationHandlerRecord {}
unsafe impl Sync for CancellationHandlerRecord {}

impl CancellationHandlerRecord {
    pub fn new(handler: unsafe fn(*mut ()), argument: *mut ()) -> CancellationHandlerRecord {
        CancellationHandlerRecord {
            base: TaskStatusRecord::new(RecordKind::CancellationHandler),
            handler,
            argument,
        }
    }

    pub fn as_record(&self) -> NonNull<TaskStatusRecord> {
        NonNull::from(&self.base)
    }
}

/// Acquires the status-word lock bit, runs `f` over the stable chain head
/// and cancelled bit, then releases, publishing whatever `f` changed.
///
/// The spin is acceptable: the lock only covers short chain edits and
/// cancellation sweeps.
pub(crate) fn with_status_lock<R>(
    status: &AtomicUsize,
    f: impl FnOnce(&mut *mut TaskStatusRecord, &mut bool) -> R,
) -> R {
    let mut current = status.load(Ordering::Relaxed);
    let locked = loop {
        let observed = ActiveTaskStatus::from_raw(current);
        if observed.is_locked() {
            hint::spin_loop();
            current = status.load(Ordering::Relaxed);
            continue;
        }
        match status.compare_exchange_weak(
            current,
            observed.raw() | IS_LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => break observed,
            Err(now) => current = now,
        }
    };

    let mut head = locked.innermost_record();
    let mut cancelled = locked.is_cancelled();
    let result = f(&mut head, &mut cancelled);

    // Holding the lock serializes every mutation, so a plain release store
    // both unlocks and publishes. The cancelled bit may only strengthen.
    debug_assert!(cancelled || !locked.is_cancelled());
    status.store(
        ActiveTaskStatus::pack(head, cancelled, false).raw(),
        Ordering::Release,
    );
    result
}

/// Pushes `record` as the innermost status record of `task`.
///
/// Returns `false` if the task was already cancelled, in which case the
/// record is pushed anyway and the caller is expected to react to the
/// cancellation itself.
///
/// # Safety
///
/// `record` must stay alive and pinned until popped, and push/pop pairs must
/// nest LIFO.
pub unsafe fn push_status_record(task: &AsyncTask, record: NonNull<TaskStatusRecord>) -> bool {
    with_status_lock(task.status_word(), |head, cancelled| {
        unsafe { *record.as_ref().parent.get() = *head };
        *head = record.as_ptr();
        !*cancelled
    })
}

/// Pops `record` from `task`'s status chain.
///
/// Popping anything but the innermost record is a programmer error.
///
/// # Safety
///
/// `record` must be the record previously pushed onto `task`.
pub unsafe fn pop_status_record(task: &AsyncTask, record: NonNull<TaskStatusRecord>) {
    with_status_lock(task.status_word(), |head, _| {
        assert_eq!(
            *head,
            record.as_ptr(),
            "status records must be popped in LIFO order"
        );
        *head = unsafe { record.as_ref().parent() };
    });
}

/// Cancels `task`: sets the sticky cancelled bit and propagates through the
/// status chain to children, task groups, and cancellation handlers.
///
/// Cancellation is cooperative — nothing is interrupted — and idempotent: a
/// second call is a no-op.
pub fn cancel(task: &AsyncTask) {
    // The whole sweep runs under the lock so the chain cannot be popped out
    // from underneath it. Recursing into children takes their locks while
    // holding ours; lock order always follows the ownership tree downwards,
    // so there is no cycle.
    with_status_lock(task.status_word(), |head, cancelled| {
        if *cancelled {
            return;
        }
        *cancelled = true;
        trace!(task = task.id().as_u64(), "cancelling task");

        let mut record = *head;
        while !record.is_null() {
            unsafe {
                match (*record).kind() {
                    RecordKind::ChildTask => {
                        let children = record.cast::<ChildTaskStatusRecord>();
                        let mut child = (*children).first_child();
                        while !child.is_null() {
                            cancel(&*child);
                            child = (*child).child_fragment().next_child();
                        }
                    }
                    RecordKind::TaskGroup => {
                        let group = record.cast::<TaskGroupRecord>();
                        (*group).group().as_ref().cancel_all();
                    }
                    RecordKind::CancellationHandler => {
                        let handler = record.cast::<CancellationHandlerRecord>();
                        ((*handler).handler)((*handler).argument);
                    }
                }
                record = (*record).parent();
            }
        }
    });
}
