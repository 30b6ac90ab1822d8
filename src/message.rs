// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! Message envelopes exchanged between the master and its workers.
//!
//! Payloads are type-erased at the channel boundary only; the public API
//! boxes tasks on dispatch and downcasts results on collection within a
//! single [`manage_tasks()`](crate::Master::manage_tasks) call. Every payload
//! is exclusively owned by whichever side currently holds the envelope.

use std::any::Any;
use std::sync::Arc;

/// An opaque, owned payload crossing a thread boundary.
pub(crate) type Payload = Box<dyn Any + Send>;

/// Type-erased work function, as installed in the workers.
pub(crate) type ErasedWorkFn =
    Arc<dyn Fn(Payload, &mut Option<Payload>) -> Payload + Send + Sync>;

/// Type-erased factory for per-worker auxiliary data.
pub(crate) type ErasedDataFactory = Arc<dyn Fn() -> Payload + Send + Sync>;

/// Type-erased destructor for per-worker auxiliary data.
pub(crate) type ErasedDataDestructor = Arc<dyn Fn(Payload) + Send + Sync>;

/// Envelope sent by the master to one worker's private mailbox.
pub(crate) struct Command {
    /// Index of the addressed worker, echoed back in the reply.
    pub(crate) worker_id: usize,
    /// Monotonically increasing identifier, scoped to one master and never
    /// reused. Used to detect protocol desynchronisation.
    pub(crate) task_id: u64,
    /// What the worker is asked to do.
    pub(crate) request: Request,
}

/// The request carried by a [`Command`].
pub(crate) enum Request {
    /// Run the installed work function on this task.
    Task(Payload),
    /// Replace the installed work function.
    SetWork(ErasedWorkFn),
    /// Create the worker-local auxiliary data.
    CreateData(ErasedDataFactory),
    /// Destroy the worker-local auxiliary data.
    DestroyData(ErasedDataDestructor),
    /// Acknowledge and terminate the worker thread.
    Retire,
}

impl Request {
    pub(crate) fn kind(&self) -> RequestKind {
        match self {
            Request::Task(_) => RequestKind::Task,
            Request::SetWork(_) => RequestKind::SetWork,
            Request::CreateData(_) => RequestKind::CreateData,
            Request::DestroyData(_) => RequestKind::DestroyData,
            Request::Retire => RequestKind::Retire,
        }
    }
}

/// Discriminant of a [`Request`], echoed in broadcast acknowledgements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Task,
    SetWork,
    CreateData,
    DestroyData,
    Retire,
}

/// Envelope sent by a worker to the shared master mailbox.
///
/// `worker_id` and `task_id` are echoed from the [`Command`] being answered;
/// the master validates both against its per-worker bookkeeping.
pub(crate) struct Reply {
    pub(crate) worker_id: usize,
    pub(crate) task_id: u64,
    pub(crate) payload: ReplyPayload,
}

pub(crate) enum ReplyPayload {
    /// The outcome of a [`Request::Task`]. `None` means the worker could not
    /// produce a result (no work function installed, or it panicked).
    TaskResult(Option<Payload>),
    /// Acknowledgement of a non-task request, carrying its kind.
    Ack(RequestKind),
}
