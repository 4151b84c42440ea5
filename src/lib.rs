//! Core data structures of a structured-concurrency task runtime, plus the
//! immutable raw syntax tree that backs its parser front-end.
//!
//! The [`task`] module defines the schedulable [`Job`](task::Job), the
//! heap-allocated [`AsyncTask`](task::AsyncTask) with its trailing fragments,
//! activation-record chains, task-local values, the cancellation record chain
//! and task groups. The [`exec`] module is the boundary to whatever executor
//! drives those jobs. The [`syntax`] module holds the arena-allocated
//! [`RawSyntax`](syntax::RawSyntax) node, its factories, and the incremental
//! reuse cache.
//!
//! This crate deliberately contains no executor: everything that needs to
//! schedule work goes through an opaque [`ExecutorRef`](exec::ExecutorRef).

pub mod exec;

pub mod syntax;

pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;
