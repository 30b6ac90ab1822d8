// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! Errors reported by [`Master`](crate::Master) operations.

use thiserror::Error;

/// Error returned by the fallible [`Master`](crate::Master) operations.
///
/// All of these leave the master in a fully consistent, reusable state:
/// either the operation rolled back completely (worker creation), or all
/// in-flight work was drained before returning (task management).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MasterError {
    /// The computation was cancelled through the
    /// [`CancelToken`](crate::CancelToken) passed to
    /// [`manage_tasks()`](crate::Master::manage_tasks).
    ///
    /// Tasks dispatched before the cancellation was observed were still
    /// completed and their results consumed.
    #[error("the computation was cancelled")]
    Cancelled,

    /// The task provider returned [`Provided::TryAgain`](crate::Provided)
    /// while no tasks were in flight.
    ///
    /// `TryAgain` means "more work exists once current tasks finish"; with
    /// nothing in flight, that work could never become available, so the
    /// call aborts instead of spinning forever.
    #[error("the task provider returned TryAgain with no tasks in flight")]
    TryAgainWithoutTasks,

    /// No worker threads have been created yet.
    ///
    /// [`create_workers()`](crate::Master::create_workers) must be called
    /// once before managing tasks or touching per-worker data.
    #[error("no worker threads have been created")]
    NoWorkers,

    /// A worker thread failed to spawn.
    ///
    /// Workers that had already started were retired again; the master is
    /// left without workers and `create_workers()` may be retried.
    #[error("failed to spawn a worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
