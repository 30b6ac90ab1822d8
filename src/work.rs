// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! Caller-facing vocabulary of a managed computation: the work function, the
//! provider outcome and the cancellation token.

use crate::message::{ErasedWorkFn, Payload};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A work function turning one task of type `T` into one result of type `R`,
/// with access to the per-worker auxiliary data of type `D` installed by
/// [`Master::create_data()`](crate::Master::create_data).
///
/// The function is invoked in worker threads (or inline in the calling thread
/// on a dumb master), so it must be `Send + Sync + 'static`. It receives
/// `None` for the data argument when no per-worker data has been installed.
///
/// A master installs the work function in every worker through a broadcast
/// the first time it is used; passing the *same* `WorkFn` (or a clone of it)
/// to successive [`manage_tasks()`](crate::Master::manage_tasks) calls skips
/// that broadcast. Wrapping the same closure in `WorkFn::new()` twice yields
/// two distinct work functions.
///
/// The work function must not panic: a panicking work function is reported as
/// a fatal error by the master.
pub struct WorkFn<T, R, D> {
    pub(crate) erased: ErasedWorkFn,
    marker: PhantomData<fn(T, D) -> R>,
}

impl<T: 'static, R: Send + 'static, D: 'static> WorkFn<T, R, D> {
    /// Wraps a plain function or closure as a work function.
    ///
    /// ```
    /// # use taskmaster::WorkFn;
    /// let work = WorkFn::new(|x: u64, _data: Option<&mut ()>| x * 2);
    /// # let _ = work;
    /// ```
    pub fn new<F>(work: F) -> Self
    where
        F: Fn(T, Option<&mut D>) -> R + Send + Sync + 'static,
    {
        let erased: ErasedWorkFn = Arc::new(move |task: Payload, data: &mut Option<Payload>| {
            let task = task
                .downcast::<T>()
                .expect("task payload type mismatch: a task of a different type was dispatched");
            let data = data.as_mut().map(|value| {
                value
                    .downcast_mut::<D>()
                    .expect("worker data type mismatch: create_data installed a different type")
            });
            Box::new(work(*task, data)) as Payload
        });
        Self {
            erased,
            marker: PhantomData,
        }
    }
}

impl<T, R, D> Clone for WorkFn<T, R, D> {
    fn clone(&self) -> Self {
        Self {
            erased: Arc::clone(&self.erased),
            marker: PhantomData,
        }
    }
}

/// Outcome of one call to a task provider.
#[derive(Debug)]
pub enum Provided<T> {
    /// A task to dispatch to a worker.
    Task(T),
    /// More work exists, but it cannot start until some of the tasks
    /// currently in flight finish. The master collects results and then asks
    /// the provider again.
    ///
    /// Returning this while no tasks are in flight is a usage error: the
    /// whole [`manage_tasks()`](crate::Master::manage_tasks) call aborts with
    /// [`MasterError::TryAgainWithoutTasks`](crate::MasterError).
    TryAgain,
    /// There is no more work. Once returned, the provider is not called
    /// again within the same `manage_tasks()` call.
    Exhausted,
}

/// A cooperative cancellation token for a managed computation.
///
/// Clones share the cancelled flag, so the token can be handed to another
/// thread and cancelled from there while the master blocks in
/// [`manage_tasks()`](crate::Master::manage_tasks). Cancellation is polled by
/// the master between result collection rounds; tasks already dispatched run
/// to completion and their results are still consumed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Irrevocable.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Whether the optional token passed to `manage_tasks()` was cancelled.
pub(crate) fn cancel_requested(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(CancelToken::is_cancelled)
}
