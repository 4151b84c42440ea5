#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::flags::JobFlags;
use crate::task::witness::ValueWitness;
use crate::task::{AsyncTask, TaskErrorBox, TaskGroup};
use std::cell::UnsafeCell;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;

/// Result-storage alignment cap: the task object itself is only aligned to
/// twice the machine word, so a result type demanding more cannot be placed
/// in the trailing storage.
pub(crate) const MAX_RESULT_ALIGN: usize = 2 * mem::align_of::<usize>();

/// A fragment of an async task that happens to be a child task.
#[repr(C)]
pub struct ChildFragment {
    /// The parent of this task. Non-owning back-reference; the parent's
    /// child-list record is what owns the children.
    parent: NonNull<AsyncTask>,

    /// The next task in the singly linked list of children, threaded from a
    /// child-list record registered with the parent.
    ///
    /// WARNING: may only be read or written by the `parent` task.
    next_child: UnsafeCell<*mut AsyncTask>,
}

impl ChildFragment {
    pub(crate) fn new(parent: NonNull<AsyncTask>) -> ChildFragment {
        ChildFragment {
            parent,
            next_child: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    pub fn parent(&self) -> NonNull<AsyncTask> {
        self.parent
    }

    /// # Safety
    ///
    /// Only the parent task may traverse the child list.
    pub unsafe fn next_child(&self) -> *mut AsyncTask {
        *self.next_child.get()
    }

    /// # Safety
    ///
    /// Only the parent of both tasks may link them.
    pub unsafe fn set_next_child(&self, task: *mut AsyncTask) {
        *self.next_child.get() = task;
    }
}

/// A fragment marking the task as a dynamically created group child. Upon
/// completing its future, such a task additionally offers itself to the
/// group so `next()` can surface the completion.
#[repr(C)]
pub struct GroupChildFragment {
    group: NonNull<TaskGroup>,
}

impl GroupChildFragment {
    pub(crate) fn new(group: NonNull<TaskGroup>) -> GroupChildFragment {
        GroupChildFragment { group }
    }

    /// The group this task offers into when it completes.
    pub fn group(&self) -> NonNull<TaskGroup> {
        self.group
    }
}

/// Status of a future, packed into the low two bits of the wait-queue word.
///
/// Futures begin `Executing` and make exactly one transition, to `Success`
/// or `Error`.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    /// Executing or ready to execute; the result storage is inaccessible.
    Executing = 0,
    /// Completed with a value of the fragment's result type.
    Success = 1,
    /// Completed by raising an error.
    Error = 2,
}

const WAIT_QUEUE_STATUS_MASK: usize = 0b11;

/// One observed value of the wait-queue word: the status in the low two
/// bits, the head of the waiter list in the rest. Task pointers are aligned
/// far beyond four bytes, so the tag bits are always free.
#[derive(Clone, Copy)]
pub(crate) struct WaitQueueItem(usize);

impl WaitQueueItem {
    pub(crate) fn pack(status: FutureStatus, head: *mut AsyncTask) -> WaitQueueItem {
        debug_assert_eq!(head as usize & WAIT_QUEUE_STATUS_MASK, 0);
        WaitQueueItem(head as usize | status as usize)
    }

    pub(crate) fn from_raw(raw: usize) -> WaitQueueItem {
        WaitQueueItem(raw)
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }

    pub(crate) fn status(self) -> FutureStatus {
        match self.0 & WAIT_QUEUE_STATUS_MASK {
            0 => FutureStatus::Executing,
            1 => FutureStatus::Success,
            _ => FutureStatus::Error,
        }
    }

    pub(crate) fn head(self) -> *mut AsyncTask {
        (self.0 & !WAIT_QUEUE_STATUS_MASK) as *mut AsyncTask
    }
}

/// A fragment making the task waitable: one result-or-error, delivered to
/// every waiter.
///
/// Trailing storage for the result itself follows the fragment, sized and
/// aligned per `result_witness`; it stays uninitialized until the future
/// completes with `Success`.
#[repr(C)]
pub struct FutureFragment {
    /// Tasks waiting on the future, plus the status, in one atomic word.
    pub(crate) wait_queue: AtomicUsize,

    /// Describes the result type held in the trailing storage.
    result_witness: &'static ValueWitness,

    /// The error the future completed with, if any.
    pub(crate) error: UnsafeCell<Option<TaskErrorBox>>,
}

impl FutureFragment {
    pub(crate) fn new(result_witness: &'static ValueWitness) -> FutureFragment {
        FutureFragment {
            wait_queue: AtomicUsize::new(
                WaitQueueItem::pack(FutureStatus::Executing, std::ptr::null_mut()).raw(),
            ),
            result_witness,
            error: UnsafeCell::new(None),
        }
    }

    pub fn result_witness(&self) -> &'static ValueWitness {
        self.result_witness
    }

    /// Offset of the result storage from the fragment base.
    pub(crate) fn storage_offset(witness: &ValueWitness) -> usize {
        round_up(mem::size_of::<FutureFragment>(), witness.align)
    }

    /// Total fragment size for a given result type.
    pub(crate) fn size(witness: &ValueWitness) -> usize {
        Self::storage_offset(witness) + witness.size
    }

    /// Pointer to the trailing result storage.
    pub fn storage_ptr(&self) -> *mut () {
        let base = self as *const FutureFragment as *mut u8;
        unsafe { base.add(Self::storage_offset(self.result_witness)).cast() }
    }

    /// Takes the error out of the fragment.
    ///
    /// # Safety
    ///
    /// Only legal once the wait queue has reached `Error`, from the single
    /// consumer of the completion.
    pub unsafe fn take_error(&self) -> Option<TaskErrorBox> {
        (*self.error.get()).take()
    }
}

/// Byte offsets of a task's trailing fragments, derived from its flag set
/// alone.
///
/// Fragments follow the fixed task object in canonical order — child, group
/// child, future — and the variable-sized future fragment is always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentOffsets {
    pub child: Option<usize>,
    pub group_child: Option<usize>,
    pub future: Option<usize>,
}

pub(crate) fn fragment_offsets(flags: JobFlags) -> FragmentOffsets {
    let mut offset = mem::size_of::<AsyncTask>();

    let child = flags.is_child_task().then(|| {
        let at = offset;
        offset += mem::size_of::<ChildFragment>();
        at
    });

    let group_child = flags.is_group_child().then(|| {
        let at = offset;
        offset += mem::size_of::<GroupChildFragment>();
        at
    });

    // Rounding to the alignment cap keeps the fragment base derivable from
    // the flag set, without knowing the result type.
    let future = flags
        .is_future()
        .then(|| round_up(offset, MAX_RESULT_ALIGN));

    FragmentOffsets {
        child,
        group_child,
        future,
    }
}

/// Heap layout of a task with the given flag set and result type.
pub(crate) fn task_layout(
    flags: JobFlags,
    result_witness: Option<&ValueWitness>,
) -> std::alloc::Layout {
    let offsets = fragment_offsets(flags);
    let mut end = mem::size_of::<AsyncTask>();

    if let Some(at) = offsets.child {
        end = at + mem::size_of::<ChildFragment>();
    }
    if let Some(at) = offsets.group_child {
        end = at + mem::size_of::<GroupChildFragment>();
    }
    if let Some(at) = offsets.future {
        let witness = result_witness.expect("future task allocated without a result type");
        assert!(
            witness.align <= MAX_RESULT_ALIGN,
            "result alignment exceeds task alignment"
        );
        end = at + FutureFragment::size(witness);
    }

    let align = mem::align_of::<AsyncTask>();
    std::alloc::Layout::from_size_align(round_up(end, align), align)
        .expect("task layout overflows")
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::witness::witness_of;
    use rstest::rstest;

    const TASK: usize = mem::size_of::<AsyncTask>();
    const CHILD: usize = mem::size_of::<ChildFragment>();
    const GROUP: usize = mem::size_of::<GroupChildFragment>();

    fn future_flags(extra: JobFlags) -> JobFlags {
        JobFlags::IS_ASYNC_TASK | JobFlags::IS_FUTURE | extra
    }

    #[test]
    fn no_fragments_no_tail() {
        let flags = JobFlags::IS_ASYNC_TASK;
        let offsets = fragment_offsets(flags);
        assert_eq!(offsets.child, None);
        assert_eq!(offsets.group_child, None);
        assert_eq!(offsets.future, None);
        assert_eq!(task_layout(flags, None).size(), TASK);
    }

    #[rstest]
    #[case::child_only(JobFlags::IS_CHILD_TASK, Some(TASK), None)]
    #[case::group_only(JobFlags::IS_GROUP_CHILD, None, Some(TASK))]
    #[case::child_and_group(
        JobFlags::IS_CHILD_TASK | JobFlags::IS_GROUP_CHILD,
        Some(TASK),
        Some(TASK + CHILD)
    )]
    fn offsets_follow_canonical_order(
        #[case] extra: JobFlags,
        #[case] child: Option<usize>,
        #[case] group_child: Option<usize>,
    ) {
        let offsets = fragment_offsets(JobFlags::IS_ASYNC_TASK | extra);
        assert_eq!(offsets.child, child);
        assert_eq!(offsets.group_child, group_child);
        assert_eq!(offsets.future, None);
    }

    #[test]
    fn future_fragment_is_last() {
        let witness = witness_of::<u64>();
        let all = future_flags(JobFlags::IS_CHILD_TASK | JobFlags::IS_GROUP_CHILD);

        let offsets = fragment_offsets(all);
        assert_eq!(offsets.child, Some(TASK));
        assert_eq!(offsets.group_child, Some(TASK + CHILD));

        let future_at = round_up(TASK + CHILD + GROUP, MAX_RESULT_ALIGN);
        assert_eq!(offsets.future, Some(future_at));
        assert_eq!(
            task_layout(all, Some(witness)).size(),
            round_up(
                future_at + FutureFragment::size(witness),
                mem::align_of::<AsyncTask>()
            )
        );
    }

    #[test]
    fn result_storage_is_aligned() {
        let witness = witness_of::<u128>();
        let offsets = fragment_offsets(future_flags(JobFlags::empty()));

        let future_at = offsets.future.unwrap();
        let storage_at = future_at + FutureFragment::storage_offset(witness);
        assert_eq!(future_at % witness.align, 0);
        assert_eq!(storage_at % witness.align, 0);
    }

    #[test]
    #[should_panic(expected = "without a result type")]
    fn future_without_witness_is_rejected() {
        let _ = task_layout(future_flags(JobFlags::empty()), None);
    }

    #[test]
    fn wait_queue_packing_round_trips() {
        let fake = 0x1000 as *mut AsyncTask;

        let item = WaitQueueItem::pack(FutureStatus::Executing, fake);
        assert_eq!(item.status(), FutureStatus::Executing);
        assert_eq!(item.head(), fake);

        let done = WaitQueueItem::pack(FutureStatus::Success, std::ptr::null_mut());
        assert_eq!(done.status(), FutureStatus::Success);
        assert!(done.head().is_null());
    }
}
