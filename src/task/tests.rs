//! End-to-end exercises of the task runtime protocols: future completion
//! under contention, cancellation across task structure, and the record
//! chain under concurrent pressure.

use crate::task::fragment::FutureStatus;
use crate::task::status::{cancel, pop_status_record, push_status_record};
use crate::task::{ChildTaskStatusRecord, GroupPoll, TaskErrorBox, TaskGroupRecord};
use crate::test_utils::{RecordingExecutor, TaskHarness, leaked_group};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[derive(Debug)]
struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[test]
fn future_waiters_resume_lifo_with_the_result() -> Result<()> {
    let executor = RecordingExecutor::leaked();
    let future = TaskHarness::future::<u64>();
    let a = TaskHarness::plain();
    let b = TaskHarness::plain();

    unsafe {
        assert_eq!(future.task().wait_future(a.raw()), FutureStatus::Executing);
        assert_eq!(future.task().wait_future(b.raw()), FutureStatus::Executing);

        future.stage_result(42u64);
        future.complete(executor.executor());
    }

    // Registration order reversed: B then A.
    assert_eq!(executor.drain(), vec![b.id(), a.id()]);

    // Both observe success and read the same result.
    assert_eq!(future.task().future_status(), FutureStatus::Success);
    unsafe {
        assert_eq!(*future.task().future_result::<u64>(), 42);
    }
    Ok(())
}

#[test]
fn concurrent_waiters_are_resumed_exactly_once() -> Result<()> {
    const WAITERS: usize = 16;

    let executor = RecordingExecutor::leaked();
    let future = TaskHarness::future::<u64>();
    let waiters: Vec<TaskHarness> = (0..WAITERS).map(|_| TaskHarness::plain()).collect();
    let registered = AtomicUsize::new(0);
    let observed_done = AtomicUsize::new(0);

    thread::scope(|scope| {
        for waiter in &waiters {
            let future = &future;
            let registered = &registered;
            let observed_done = &observed_done;
            scope.spawn(move || {
                match unsafe { future.task().wait_future(waiter.raw()) } {
                    FutureStatus::Executing => {
                        registered.fetch_add(1, Ordering::Relaxed);
                    }
                    FutureStatus::Success => {
                        // Completed before we registered; we resume ourselves.
                        observed_done.fetch_add(1, Ordering::Relaxed);
                    }
                    FutureStatus::Error => panic!("future never errs in this test"),
                }
            });
        }

        scope.spawn(|| unsafe {
            future.stage_result(7u64);
            future.complete(executor.executor());
        });
    });

    // Every waiter either made it into the queue and was enqueued by the
    // completion, or observed the terminal status on its own.
    let resumed = executor.drain();
    assert_eq!(resumed.len(), registered.load(Ordering::Relaxed));
    assert_eq!(
        resumed.len() + observed_done.load(Ordering::Relaxed),
        WAITERS
    );
    assert_eq!(future.task().future_status(), FutureStatus::Success);
    Ok(())
}

#[test]
fn cancel_before_wait_is_visible_and_harmless() -> Result<()> {
    let task = TaskHarness::plain();

    cancel(task.task());
    assert!(task.task().is_cancelled());

    // Records can still be pushed and popped on a cancelled task; the push
    // just reports the existing cancellation.
    let record = ChildTaskStatusRecord::new();
    unsafe {
        assert!(!push_status_record(task.task(), record.as_record()));
        pop_status_record(task.task(), record.as_record());
    }
    assert!(task.task().is_cancelled());
    Ok(())
}

#[test]
fn structural_cancellation_reaches_group_children() -> Result<()> {
    let executor = RecordingExecutor::leaked();
    let parent = TaskHarness::plain();
    let group = leaked_group();

    let children = ChildTaskStatusRecord::new();
    let group_record = TaskGroupRecord::new(group.into());
    unsafe {
        push_status_record(parent.task(), children.as_record());
        push_status_record(parent.task(), group_record.as_record());
    }

    let c1 = TaskHarness::structured_child::<u64>(&parent, group);
    let c2 = TaskHarness::structured_child::<u64>(&parent, group);
    unsafe {
        children.add_child(c1.raw());
        children.add_child(c2.raw());
    }

    cancel(parent.task());

    // Both children observe cancellation at their next check.
    assert!(c1.task().is_cancelled());
    assert!(c2.task().is_cancelled());

    // They still run to completion, in the error state, and the group
    // surfaces the remaining completions before reporting exhaustion.
    unsafe {
        c1.stage_error(Box::new(Cancelled) as TaskErrorBox);
        c1.complete(executor.executor());
        c2.stage_error(Box::new(Cancelled) as TaskErrorBox);
        c2.complete(executor.executor());

        let mut drained = 0;
        loop {
            match group.next(parent.raw()) {
                GroupPoll::Ready(child) => {
                    assert_eq!(child.as_ref().future_status(), FutureStatus::Error);
                    drained += 1;
                }
                GroupPoll::Exhausted => break,
                GroupPoll::Pending => panic!("completions were already offered"),
            }
        }
        assert_eq!(drained, 2);
    }

    unsafe {
        pop_status_record(parent.task(), group_record.as_record());
        pop_status_record(parent.task(), children.as_record());
    }
    Ok(())
}

#[test]
fn cancellation_is_sticky_under_contention() -> Result<()> {
    let task = TaskHarness::plain();

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    cancel(task.task());
                    assert!(task.task().is_cancelled());
                }
            });
        }
    });

    assert!(task.task().is_cancelled());
    Ok(())
}

#[test]
fn record_chain_stays_lifo_under_concurrent_cancellers() -> Result<()> {
    let task = TaskHarness::plain();

    thread::scope(|scope| {
        // Cancellers hammer the lock bit while the "task" pushes and pops.
        let cancellers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..200 {
                        cancel(task.task());
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let a = ChildTaskStatusRecord::new();
            let b = ChildTaskStatusRecord::new();
            unsafe {
                push_status_record(task.task(), a.as_record());
                push_status_record(task.task(), b.as_record());
                pop_status_record(task.task(), b.as_record());
                pop_status_record(task.task(), a.as_record());
            }
        }

        for canceller in cancellers {
            canceller.join().expect("canceller paniced");
        }
    });

    assert!(task.task().is_cancelled());
    Ok(())
}
