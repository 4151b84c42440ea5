#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::AsyncTask;
use crate::task::witness::ValueWitness;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr::NonNull;

/// Whether a task-local lookup may continue into the stacks of ancestor
/// tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskLocalInheritance {
    /// Only this task's own bindings are visible.
    DontInherit,
    /// Walk parent tasks through the child fragment. Safe because the
    /// parent chain is established before the child first runs and parent
    /// frames outlive their children's scopes.
    #[default]
    Inherit,
}

/// One pushed binding. Frames live in the task's stack allocator, with the
/// bound value stored inline right after the header.
#[repr(C)]
struct LocalFrame {
    key: NonNull<()>,
    witness: &'static ValueWitness,
    next: *mut LocalFrame,
}

impl LocalFrame {
    fn value_offset(witness: &ValueWitness) -> usize {
        crate::task::fragment::round_up(mem::size_of::<LocalFrame>(), witness.align)
    }

    fn frame_size(witness: &ValueWitness) -> usize {
        Self::value_offset(witness) + witness.size
    }

    unsafe fn value_ptr(frame: *mut LocalFrame) -> *mut () {
        let witness = (*frame).witness;
        frame.cast::<u8>().add(Self::value_offset(witness)).cast()
    }
}

/// Head of a task's singly linked stack of task-local bindings.
///
/// A single word, embedded in the task object. Only the owning task pushes
/// and pops; other tasks may read through it only via the inheritance walk,
/// which is ordered before the reader ever runs.
#[repr(C)]
pub struct TaskLocalStorage {
    head: UnsafeCell<*mut LocalFrame>,
}

impl TaskLocalStorage {
    pub(crate) fn new() -> TaskLocalStorage {
        TaskLocalStorage {
            head: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    unsafe fn head(&self) -> *mut LocalFrame {
        *self.head.get()
    }

    /// Prepends a binding of `key` to the value at `value`, taking ownership
    /// of it.
    ///
    /// # Safety
    ///
    /// Must be called by the thread currently running `task`; `value` must
    /// point at an initialized value described by `witness`, which is moved
    /// out of.
    pub(crate) unsafe fn push(
        &self,
        task: &AsyncTask,
        key: NonNull<()>,
        value: *const (),
        witness: &'static ValueWitness,
    ) {
        let frame = task
            .allocator()
            .alloc(LocalFrame::frame_size(witness), mem::align_of::<LocalFrame>())
            .cast::<LocalFrame>();

        frame.write(LocalFrame {
            key,
            witness,
            next: self.head(),
        });
        std::ptr::copy_nonoverlapping(
            value.cast::<u8>(),
            LocalFrame::value_ptr(frame).cast(),
            witness.size,
        );

        *self.head.get() = frame;
    }

    /// Returns the innermost binding of `key`, optionally consulting
    /// ancestor tasks.
    ///
    /// # Safety
    ///
    /// Must be called by the thread currently running the task owning this
    /// storage (or one of its descendants, via inheritance).
    pub(crate) unsafe fn get(
        &self,
        task: &AsyncTask,
        key: NonNull<()>,
        inherit: TaskLocalInheritance,
    ) -> Option<NonNull<()>> {
        let mut frame = self.head();
        while !frame.is_null() {
            if (*frame).key == key {
                return Some(NonNull::new_unchecked(LocalFrame::value_ptr(frame)));
            }
            frame = (*frame).next;
        }

        if inherit == TaskLocalInheritance::Inherit && task.job().flags().is_child_task() {
            let parent = task.child_fragment().parent();
            let parent = parent.as_ref();
            return parent.local_storage().get(parent, key, inherit);
        }
        None
    }

    /// Removes the topmost binding, dropping its value and reclaiming the
    /// frame from the task allocator.
    ///
    /// # Safety
    ///
    /// Must be called by the thread currently running `task`; the stack must
    /// be non-empty, and the frame must be the task allocator's most recent
    /// live allocation.
    pub(crate) unsafe fn pop(&self, task: &AsyncTask) {
        let frame = self.head();
        assert!(!frame.is_null(), "task-local pop on an empty stack");

        *self.head.get() = (*frame).next;
        (*frame)
            .witness
            .drop_in_place(LocalFrame::value_ptr(frame));
        task.allocator().dealloc(frame.cast());
    }

    /// Drops every remaining binding. Runs during task destruction, where
    /// leftover frames would otherwise leak their values.
    ///
    /// # Safety
    ///
    /// Only during destruction of the owning task, after it can no longer
    /// run.
    pub(crate) unsafe fn drain(&self, task: &AsyncTask) {
        while !self.head().is_null() {
            self.pop(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TaskHarness, local_key};

    #[test]
    fn innermost_binding_wins() {
        let harness = TaskHarness::plain();
        let task = harness.task();
        let key = local_key(0);

        unsafe {
            task.local_value_push(key, 7u64);
            task.local_value_push(key, 8u64);
            assert_eq!(task.local_value_get::<u64>(key, Default::default()), Some(&8));

            task.local_value_pop();
            assert_eq!(task.local_value_get::<u64>(key, Default::default()), Some(&7));

            task.local_value_pop();
            assert_eq!(task.local_value_get::<u64>(key, Default::default()), None);
        }
    }

    #[test]
    fn distinct_keys_do_not_alias() {
        let harness = TaskHarness::plain();
        let task = harness.task();

        unsafe {
            task.local_value_push(local_key(1), 1u32);
            task.local_value_push(local_key(2), 2u32);

            assert_eq!(
                task.local_value_get::<u32>(local_key(1), Default::default()),
                Some(&1)
            );
            assert_eq!(
                task.local_value_get::<u32>(local_key(2), Default::default()),
                Some(&2)
            );

            task.local_value_pop();
            task.local_value_pop();
        }
    }

    #[test]
    fn child_inherits_parent_bindings() {
        let parent = TaskHarness::plain();
        let key = local_key(3);
        unsafe { parent.task().local_value_push(key, String::from("inherited")) };

        let child = TaskHarness::child_of(&parent);
        let task = child.task();

        unsafe {
            let inherited = task
                .local_value_get::<String>(key, TaskLocalInheritance::Inherit)
                .expect("binding should be visible through the parent");
            assert_eq!(inherited, "inherited");

            assert_eq!(
                task.local_value_get::<String>(key, TaskLocalInheritance::DontInherit),
                None
            );

            // Shadow it locally; the child's binding wins.
            task.local_value_push(key, String::from("own"));
            assert_eq!(
                task.local_value_get::<String>(key, TaskLocalInheritance::Inherit)
                    .unwrap(),
                "own"
            );
            task.local_value_pop();
        }

        unsafe { parent.task().local_value_pop() };
    }

    #[test]
    fn leftover_bindings_are_dropped_with_the_task() {
        let harness = TaskHarness::plain();
        // Pushed and never popped: destruction drains it.
        unsafe {
            harness
                .task()
                .local_value_push(local_key(4), vec![1u8, 2, 3])
        };
        drop(harness);
    }
}
