#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::ExecutorRef;
use crate::task::alloc::StackAllocator;
use crate::task::flags::{JobFlags, Priority};
use crate::task::fragment::{
    self, ChildFragment, FragmentOffsets, FutureFragment, GroupChildFragment, WaitQueueItem,
};
use crate::task::id::TaskId;
use crate::task::job::{Job, TaskResumeFn};
use crate::task::local::{TaskLocalInheritance, TaskLocalStorage};
use crate::task::status::ActiveTaskStatus;
use crate::task::witness::{ValueWitness, witness_of};
use crate::task::{AsyncContext, TaskGroup};
use std::alloc;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Reference count and teardown entry of a heap-allocated task.
#[repr(C)]
struct HeapHeader {
    refcount: AtomicUsize,
    destroy: unsafe fn(NonNull<AsyncTask>),
}

/// An asynchronous task: the persistent identity of one async computation.
///
/// Tasks are heap objects embedding a [`Job`]; an executor that dequeues the
/// job resumes the task at its current activation record. The fixed part of
/// the object is fourteen machine words — an ABI constant — and optional
/// trailing fragments follow it in canonical order:
///
/// ```text
///    +--------------------------+
///    | child fragment?          |
///    | group-child fragment?    |
///    | future fragment?         |*
///    +--------------------------+
/// ```
///
/// * variable-sized (it embeds the result storage), hence always last.
///
/// Which fragments exist is fixed at allocation by the job flags; their
/// offsets derive from the flag set alone.
#[repr(C, align(16))]
pub struct AsyncTask {
    heap: HeapHeader,

    job: Job,

    /// The activation record to resume at, committed at every suspension
    /// point before control is released.
    resume_context: UnsafeCell<*mut AsyncContext>,

    /// The currently-active cancellation information: innermost status
    /// record plus the cancelled and locked bits.
    status: AtomicUsize,

    /// Reserved for the task-local stack allocator.
    allocator_private: [UnsafeCell<usize>; 4],

    /// Task-local values bound on this task.
    local: TaskLocalStorage,

    id: TaskId,
}

static_assertions::const_assert_eq!(mem::size_of::<AsyncTask>(), 14 * mem::size_of::<usize>());
static_assertions::const_assert_eq!(mem::align_of::<AsyncTask>(), 2 * mem::align_of::<usize>());

// Safety: shared mutable state is confined to atomics, lock-protected
// chains, and single-runner cells, per the individual field contracts.
unsafe impl Send for AsyncTask {}
unsafe impl Sync for AsyncTask {}

impl AsyncTask {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Checks whether this task has been cancelled.
    /// Checking this is, of course, inherently race-prone on its own.
    pub fn is_cancelled(&self) -> bool {
        ActiveTaskStatus::from_raw(self.status.load(Ordering::Relaxed)).is_cancelled()
    }

    pub(crate) fn status_word(&self) -> &AtomicUsize {
        &self.status
    }

    pub(crate) fn allocator(&self) -> StackAllocator<'_> {
        StackAllocator::new(&self.allocator_private)
    }

    pub(crate) fn local_storage(&self) -> &TaskLocalStorage {
        &self.local
    }

    // ==== Job embedding ====================================================

    /// Recovers the task from a pointer to its embedded job.
    ///
    /// # Safety
    ///
    /// `job` must be the job header of a live `AsyncTask`.
    pub unsafe fn from_job(job: NonNull<Job>) -> NonNull<AsyncTask> {
        debug_assert!(job.as_ref().is_async_task());
        let offset = mem::offset_of!(AsyncTask, job);
        NonNull::new_unchecked(job.as_ptr().byte_sub(offset).cast())
    }

    /// The task's job header, suitable for handing to an executor.
    ///
    /// # Safety
    ///
    /// `this` must point at a live task.
    pub unsafe fn as_job(this: NonNull<AsyncTask>) -> NonNull<Job> {
        NonNull::new_unchecked(&raw mut (*this.as_ptr()).job)
    }

    /// Starts running this task, given that the current thread has already
    /// been fully established on `current_executor`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Job::run_in_fully_established_context`].
    pub unsafe fn run_in_fully_established_context(
        this: NonNull<AsyncTask>,
        current_executor: ExecutorRef,
    ) {
        let task = this.as_ref();
        let resume = task.job.resume_entry();
        resume(this, current_executor, task.resume_context_ptr())
    }

    /// Installs the resume point control returns to after the next
    /// suspension.
    ///
    /// # Safety
    ///
    /// Only the thread currently running the task may commit resume points,
    /// before the task becomes schedulable again.
    pub unsafe fn commit_resume_point(&self, resume: TaskResumeFn, context: *mut AsyncContext) {
        self.job.set_resume_entry(resume);
        *self.resume_context.get() = context;
    }

    pub(crate) fn resume_context_ptr(&self) -> *mut AsyncContext {
        unsafe { *self.resume_context.get() }
    }

    // ==== Task-local values ================================================

    /// Binds `value` to `key` on this task's local-value stack, transferring
    /// ownership in.
    ///
    /// # Safety
    ///
    /// Must be called from the thread currently running this task.
    pub unsafe fn local_value_push<T>(&self, key: NonNull<()>, value: T) {
        let value = mem::ManuallyDrop::new(value);
        self.local
            .push(self, key, (&raw const value).cast(), witness_of::<T>());
    }

    /// Looks up the innermost binding of `key`, optionally walking ancestor
    /// tasks.
    ///
    /// # Safety
    ///
    /// Must be called from the thread currently running this task, and `T`
    /// must be the type the binding was pushed with.
    pub unsafe fn local_value_get<T>(
        &self,
        key: NonNull<()>,
        inherit: TaskLocalInheritance,
    ) -> Option<&T> {
        self.local
            .get(self, key, inherit)
            .map(|ptr| ptr.cast::<T>().as_ref())
    }

    /// Removes the topmost binding, dropping its value.
    ///
    /// # Safety
    ///
    /// Must be called from the thread currently running this task, and the
    /// binding frame must be the task allocator's most recent allocation.
    pub unsafe fn local_value_pop(&self) {
        self.local.pop(self);
    }

    // ==== Fragments ========================================================

    fn fragment_offsets(&self) -> FragmentOffsets {
        fragment::fragment_offsets(self.job.flags())
    }

    unsafe fn fragment_ptr<T>(&self, offset: usize) -> &T {
        &*(self as *const AsyncTask)
            .cast::<u8>()
            .add(offset)
            .cast::<T>()
    }

    /// The child fragment. Panics unless the task was allocated as a child.
    pub fn child_fragment(&self) -> &ChildFragment {
        let offset = self
            .fragment_offsets()
            .child
            .expect("task has no child fragment");
        unsafe { self.fragment_ptr(offset) }
    }

    /// The group-child fragment. Panics unless the task was allocated into
    /// a group.
    pub fn group_child_fragment(&self) -> &GroupChildFragment {
        let offset = self
            .fragment_offsets()
            .group_child
            .expect("task has no group-child fragment");
        unsafe { self.fragment_ptr(offset) }
    }

    /// The future fragment. Panics unless the task was allocated as a
    /// future.
    pub fn future_fragment(&self) -> &FutureFragment {
        let offset = self
            .fragment_offsets()
            .future
            .expect("task has no future fragment");
        unsafe { self.fragment_ptr(offset) }
    }

    /// Current status of this task's future. Panics unless the task is one.
    pub fn future_status(&self) -> crate::task::FutureStatus {
        let raw = self.future_fragment().wait_queue.load(Ordering::Acquire);
        WaitQueueItem::from_raw(raw).status()
    }

    // ==== Reference counting ===============================================

    pub(crate) fn ref_inc(&self) {
        self.heap.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the caller dropped the last reference and must
    /// destroy the task.
    pub(crate) fn ref_dec(&self) -> bool {
        if self.heap.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("id", &self.id)
            .field("flags", &self.job.flags())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Configures and allocates an [`AsyncTask`].
///
/// The builder owns the translation from requested shape to job flags, so
/// the flag set and the fragments always agree.
pub struct TaskBuilder {
    flags: JobFlags,
    parent: Option<NonNull<AsyncTask>>,
    group: Option<NonNull<TaskGroup>>,
    result_witness: Option<&'static ValueWitness>,
}

impl TaskBuilder {
    pub fn new() -> TaskBuilder {
        TaskBuilder {
            flags: JobFlags::IS_ASYNC_TASK.with_priority(Priority::default()),
            parent: None,
            group: None,
            result_witness: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> TaskBuilder {
        self.flags = self.flags.with_priority(priority);
        self
    }

    /// Allocate a child fragment naming `parent`.
    pub fn child_of(mut self, parent: NonNull<AsyncTask>) -> TaskBuilder {
        self.flags |= JobFlags::IS_CHILD_TASK;
        self.parent = Some(parent);
        self
    }

    /// Allocate a group-child fragment pointing at `group`.
    pub fn group_child(mut self, group: NonNull<TaskGroup>) -> TaskBuilder {
        self.flags |= JobFlags::IS_GROUP_CHILD;
        self.group = Some(group);
        self
    }

    /// Allocate a future fragment able to hold a `T`.
    pub fn future<T>(mut self) -> TaskBuilder {
        self.flags |= JobFlags::IS_FUTURE;
        self.result_witness = Some(witness_of::<T>());
        self
    }

    /// Allocates the task with `resume` as its first resume point and
    /// `initial_context` as its root activation record.
    ///
    /// # Safety
    ///
    /// `initial_context` must stay valid until replaced by a later commit;
    /// any parent and group passed to the builder must outlive the task.
    pub unsafe fn build(self, resume: TaskResumeFn, initial_context: *mut AsyncContext) -> TaskRef {
        let layout = fragment::task_layout(self.flags, self.result_witness);
        let ptr = alloc::alloc(layout).cast::<AsyncTask>();
        let Some(task) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };

        task.write(AsyncTask {
            heap: HeapHeader {
                refcount: AtomicUsize::new(1),
                destroy,
            },
            job: Job::new_task(self.flags, resume),
            resume_context: UnsafeCell::new(initial_context),
            status: AtomicUsize::new(ActiveTaskStatus::initial().raw()),
            allocator_private: [const { UnsafeCell::new(0) }; 4],
            local: TaskLocalStorage::new(),
            id: TaskId::next(),
        });

        let offsets = fragment::fragment_offsets(self.flags);
        let base = task.as_ptr().cast::<u8>();
        if let Some(at) = offsets.child {
            let parent = self.parent.expect("child task needs a parent");
            base.add(at)
                .cast::<ChildFragment>()
                .write(ChildFragment::new(parent));
        }
        if let Some(at) = offsets.group_child {
            let group = self.group.expect("group child needs a group");
            base.add(at)
                .cast::<GroupChildFragment>()
                .write(GroupChildFragment::new(group));
        }
        if let Some(at) = offsets.future {
            let witness = self.result_witness.expect("future task needs a result type");
            base.add(at)
                .cast::<FutureFragment>()
                .write(FutureFragment::new(witness));
        }

        // Register with the group only once the task is fully formed; the
        // group may cancel it immediately.
        if let Some(group) = self.group {
            group.as_ref().on_child_created(task);
        }

        TaskRef { raw: task }
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tears down and frees a task whose last reference was dropped.
unsafe fn destroy(this: NonNull<AsyncTask>) {
    let task = this.as_ref();
    let flags = task.job.flags();

    // Bindings the task never popped still own their values.
    task.local.drain(task);
    task.allocator().release_all();

    let witness = if flags.is_future() {
        let fragment = task.future_fragment();
        let raw = fragment.wait_queue.load(Ordering::Acquire);
        if WaitQueueItem::from_raw(raw).status() == crate::task::FutureStatus::Success {
            fragment
                .result_witness()
                .drop_in_place(fragment.storage_ptr());
        }
        std::ptr::drop_in_place(fragment.error.get());
        Some(fragment.result_witness())
    } else {
        None
    };

    let layout = fragment::task_layout(flags, witness);
    alloc::dealloc(this.as_ptr().cast(), layout);
}

/// An owned, counted reference to an [`AsyncTask`].
///
/// The task is destroyed when the last reference drops. Executors and wait
/// queues hold raw job pointers instead; whoever enqueues a task is
/// responsible for keeping a `TaskRef` alive until it has run.
pub struct TaskRef {
    raw: NonNull<AsyncTask>,
}

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    pub fn raw(&self) -> NonNull<AsyncTask> {
        self.raw
    }
}

impl std::ops::Deref for TaskRef {
    type Target = AsyncTask;

    fn deref(&self) -> &AsyncTask {
        unsafe { self.raw.as_ref() }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> TaskRef {
        self.ref_inc();
        TaskRef { raw: self.raw }
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        unsafe {
            if self.raw.as_ref().ref_dec() {
                let destroy = self.raw.as_ref().heap.destroy;
                destroy(self.raw);
            }
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({:p})", self.raw.as_ptr())
    }
}
