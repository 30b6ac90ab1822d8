// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! The master: worker lifecycle, the broadcast barrier and the task
//! scheduling loop.

use crate::dumb::DumbMaster;
use crate::error::MasterError;
use crate::macros::{log_debug, log_error, log_warn};
use crate::message::{
    Command, ErasedDataDestructor, ErasedDataFactory, ErasedWorkFn, Payload, Reply, ReplyPayload,
    Request, RequestKind,
};
use crate::work::{cancel_requested, CancelToken, Provided, WorkFn};
use crate::worker;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Number of worker threads to create in a master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCount {
    /// Create the number of workers returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Create the given number of workers.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for WorkerCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(worker_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(worker_count)?;
        Ok(WorkerCount::Count(count))
    }
}

/// Maximum number of tasks a [`manage_tasks()`](Master::manage_tasks) call
/// keeps in flight at once.
///
/// The effective concurrency never exceeds the number of workers; this limit
/// only tightens it further.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TaskLimit {
    /// As many tasks in flight as there are workers.
    #[default]
    Unlimited,
    /// At most the given number of tasks in flight.
    Max(NonZeroUsize),
}

impl TaskLimit {
    /// The in-flight task bound for a pool of `num_workers` workers.
    fn effective(self, num_workers: usize) -> usize {
        match self {
            TaskLimit::Unlimited => num_workers,
            TaskLimit::Max(max) => max.get().min(num_workers),
        }
    }
}

impl TryFrom<usize> for TaskLimit {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(limit: usize) -> Result<Self, Self::Error> {
        let max = NonZeroUsize::try_from(limit)?;
        Ok(TaskLimit::Max(max))
    }
}

/// A synchronous parallel task coordinator.
///
/// A master owns a fixed set of long-lived worker threads (created once with
/// [`create_workers()`](Self::create_workers)) and runs chunked computations
/// over them: [`manage_tasks()`](Self::manage_tasks) blocks the calling
/// thread until the provided work is exhausted or cancelled. Staged
/// calculations are expressed as successive `manage_tasks()` calls on the
/// same master, optionally bracketed by
/// [`create_data()`](Self::create_data) / [`destroy_data()`](Self::destroy_data)
/// to manage per-worker auxiliary state.
///
/// Dropping the master retires all workers and joins their threads.
///
/// A master is not shared between threads; only a [`CancelToken`] may be
/// touched from elsewhere while a computation runs.
pub struct Master {
    inner: MasterImpl,
}

/// Underlying [`Master`] implementation, dispatching over the backend.
enum MasterImpl {
    Threaded(ThreadedMaster),
    Dumb(DumbMaster),
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Master {
    /// Creates a new master with no workers yet.
    pub fn new() -> Self {
        Self {
            inner: MasterImpl::Threaded(ThreadedMaster::new()),
        }
    }

    /// Creates a new dumb master.
    ///
    /// A dumb master exposes the identical interface but performs all work
    /// inline in the calling thread and never spawns a thread. It is useful
    /// for testing, and for code paths that must not parallelise: for any
    /// pure provider/work/consumer triple it produces the same aggregated
    /// results as a threaded master with any worker count.
    pub fn new_dumb() -> Self {
        Self {
            inner: MasterImpl::Dumb(DumbMaster::new()),
        }
    }

    /// Returns whether this master runs its work inline in the calling
    /// thread.
    pub fn is_dumb(&self) -> bool {
        matches!(self.inner, MasterImpl::Dumb(_))
    }

    /// Returns the number of workers created so far.
    ///
    /// A dumb master counts as one worker once `create_workers()` has been
    /// called.
    pub fn num_workers(&self) -> usize {
        match &self.inner {
            MasterImpl::Threaded(threaded) => threaded.num_workers(),
            MasterImpl::Dumb(dumb) => dumb.num_workers(),
        }
    }

    /// Creates the worker threads.
    ///
    /// Must be called once before [`manage_tasks()`](Self::manage_tasks),
    /// [`create_data()`](Self::create_data) or
    /// [`destroy_data()`](Self::destroy_data). Calling it again on a master
    /// that already has workers logs a warning and succeeds without creating
    /// a second generation of workers.
    ///
    /// If any thread fails to spawn, the workers that had already started
    /// are retired again and the call returns [`MasterError::Spawn`]; the
    /// master never ends up half-started.
    ///
    /// On a dumb master this records that setup happened and spawns nothing.
    pub fn create_workers(&mut self, count: WorkerCount) -> Result<(), MasterError> {
        match &mut self.inner {
            MasterImpl::Threaded(threaded) => threaded.create_workers(count),
            MasterImpl::Dumb(dumb) => dumb.create_workers(),
        }
    }

    /// Runs a chunked computation to completion.
    ///
    /// Repeatedly calls `provide` in the calling thread to obtain tasks,
    /// dispatches each task to an idle worker (keeping at most
    /// `limit`-many in flight), and hands every result to `consume` in the
    /// calling thread. Returns when the provider is exhausted and every
    /// dispatched task has been collected.
    ///
    /// Results arrive in completion order: callers must not assume it
    /// matches the order tasks were provided.
    ///
    /// If `cancel` is cancelled before the call, returns
    /// [`MasterError::Cancelled`] without calling `provide`. If it is
    /// cancelled mid-run, no further task is dispatched, but tasks already
    /// in flight are drained and consumed before `Err(Cancelled)` is
    /// returned — the master never abandons in-flight work.
    ///
    /// The first use of a [`WorkFn`] installs it in every worker through a
    /// blocking broadcast; reusing the same `WorkFn` (or a clone) in later
    /// calls skips that step.
    pub fn manage_tasks<T, R, D, P, C>(
        &mut self,
        limit: TaskLimit,
        work: &WorkFn<T, R, D>,
        mut provide: P,
        mut consume: C,
        cancel: Option<&CancelToken>,
    ) -> Result<(), MasterError>
    where
        T: Send + 'static,
        R: Send + 'static,
        P: FnMut() -> Provided<T>,
        C: FnMut(R),
    {
        let mut provide_erased = move || match provide() {
            Provided::Task(task) => Provided::Task(Box::new(task) as Payload),
            Provided::TryAgain => Provided::TryAgain,
            Provided::Exhausted => Provided::Exhausted,
        };
        let mut consume_erased = move |result: Payload| {
            let result = result
                .downcast::<R>()
                .expect("result payload type mismatch: the work function returned a different type");
            consume(*result);
        };
        match &mut self.inner {
            MasterImpl::Threaded(threaded) => threaded.manage_tasks(
                limit,
                &work.erased,
                &mut provide_erased,
                &mut consume_erased,
                cancel,
            ),
            MasterImpl::Dumb(dumb) => {
                dumb.manage_tasks(&work.erased, &mut provide_erased, &mut consume_erased, cancel)
            }
        }
    }

    /// Installs per-worker auxiliary data.
    ///
    /// The factory runs once in every worker thread, in parallel, and this
    /// call blocks until all workers have acknowledged — a quiescence
    /// barrier. The data is handed to the work function of every subsequent
    /// task run by that worker, across as many
    /// [`manage_tasks()`](Self::manage_tasks) stages as needed, until
    /// [`destroy_data()`](Self::destroy_data) tears it down.
    ///
    /// On a dumb master the single data value is created synchronously.
    ///
    /// Data still installed when the master is dropped is dropped with the
    /// worker; the destructor passed to `destroy_data()` does not run for
    /// it.
    pub fn create_data<D, F>(&mut self, factory: F) -> Result<(), MasterError>
    where
        D: Send + 'static,
        F: Fn() -> D + Send + Sync + 'static,
    {
        let factory: ErasedDataFactory = Arc::new(move || Box::new(factory()) as Payload);
        match &mut self.inner {
            MasterImpl::Threaded(threaded) => threaded.create_data(factory),
            MasterImpl::Dumb(dumb) => dumb.create_data(factory),
        }
    }

    /// Tears down per-worker auxiliary data.
    ///
    /// The destructor runs once in every worker thread that holds data, in
    /// parallel, and this call blocks until all workers have acknowledged.
    /// Workers without installed data (or whose factory panicked) skip the
    /// destructor.
    pub fn destroy_data<D, F>(&mut self, destructor: F) -> Result<(), MasterError>
    where
        D: Send + 'static,
        F: Fn(D) + Send + Sync + 'static,
    {
        let destructor: ErasedDataDestructor = Arc::new(move |value: Payload| {
            match value.downcast::<D>() {
                Ok(value) => destructor(*value),
                Err(_value) => log_error!(
                    "worker data type mismatch: dropping the data without running the destructor"
                ),
            }
        });
        match &mut self.inner {
            MasterImpl::Threaded(threaded) => threaded.destroy_data(destructor),
            MasterImpl::Dumb(dumb) => dumb.destroy_data(destructor),
        }
    }
}

/// The threaded backend: worker threads, mailboxes and scheduling state.
struct ThreadedMaster {
    /// Sending half of the shared mailbox, cloned into every worker.
    reply_tx: Sender<Reply>,
    /// Receiving half of the shared mailbox. The only place the master
    /// blocks, during result collection and broadcast acknowledgement.
    reply_rx: Receiver<Reply>,
    /// One handle per worker thread, indexed by `worker_id`.
    workers: Vec<WorkerHandle>,
    /// Indices of workers with no task in flight. The pop order is
    /// unspecified (not guaranteed LIFO).
    idle_workers: Vec<usize>,
    /// Monotonically increasing message counter, never reused.
    task_id: u64,
    /// Number of tasks currently in flight. Always
    /// `workers.len() - idle_workers.len()` at the points where it is read.
    active_tasks: usize,
    /// The work function currently installed in the workers.
    work: Option<ErasedWorkFn>,
}

/// Handle to one worker thread.
struct WorkerHandle {
    /// Thread handle object.
    thread: JoinHandle<()>,
    /// Sending half of the worker's private mailbox.
    mailbox: Sender<Command>,
    /// `task_id` of the message currently in flight to/from this worker,
    /// or 0 when none is.
    pending: u64,
}

impl ThreadedMaster {
    fn new() -> Self {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        Self {
            reply_tx,
            reply_rx,
            workers: Vec::new(),
            idle_workers: Vec::new(),
            task_id: 0,
            active_tasks: 0,
            work: None,
        }
    }

    fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn create_workers(&mut self, count: WorkerCount) -> Result<(), MasterError> {
        if !self.workers.is_empty() {
            log_warn!("the master already has {} workers", self.workers.len());
            return Ok(());
        }

        let requested = match count {
            WorkerCount::AvailableParallelism => std::thread::available_parallelism()?.get(),
            WorkerCount::Count(count) => count.get(),
        };

        for worker_id in 0..requested {
            let (mailbox, inbox) = crossbeam_channel::unbounded();
            let outbox = self.reply_tx.clone();
            let builder = std::thread::Builder::new().name(format!("worker{worker_id}"));
            let thread = match builder.spawn(move || worker::worker_main(inbox, outbox)) {
                Ok(thread) => thread,
                Err(err) => {
                    log_error!(
                        "failed to spawn worker {worker_id}: {err}; retiring the {} workers already started",
                        self.workers.len()
                    );
                    self.retire_workers();
                    return Err(MasterError::Spawn(err));
                }
            };
            self.workers.push(WorkerHandle {
                thread,
                mailbox,
                pending: 0,
            });
        }

        self.idle_workers = (0..self.workers.len()).collect();
        log_debug!("[master] spawned {} worker threads", self.workers.len());
        Ok(())
    }

    /// The broadcast barrier: sends one request to every worker and blocks
    /// until every worker has fully processed it and acknowledged.
    ///
    /// The sole mechanism behind `SetWork`, `CreateData`, `DestroyData` and
    /// `Retire`. Acknowledgements arrive in arbitrary worker order; each is
    /// matched to its worker through the echoed `worker_id` and `task_id`.
    fn notify_all_workers(&mut self, kind: RequestKind, mut request: impl FnMut() -> Request) {
        assert_eq!(
            self.active_tasks, 0,
            "cannot broadcast {kind:?} while tasks are in flight"
        );

        for worker_id in 0..self.workers.len() {
            self.task_id += 1;
            let task_id = self.task_id;
            let request = request();
            debug_assert_eq!(request.kind(), kind);
            let worker = &mut self.workers[worker_id];
            debug_assert_eq!(worker.pending, 0);
            worker.pending = task_id;
            worker
                .mailbox
                .send(Command {
                    worker_id,
                    task_id,
                    request,
                })
                .expect("a worker mailbox disconnected");
        }

        for _ in 0..self.workers.len() {
            let reply = self
                .reply_rx
                .recv()
                .expect("all workers disconnected during a broadcast");
            assert!(
                reply.worker_id < self.workers.len(),
                "acknowledgement from unknown worker {}",
                reply.worker_id
            );
            let worker = &mut self.workers[reply.worker_id];
            assert_eq!(
                reply.task_id, worker.pending,
                "acknowledgement identifier mismatch from worker {}",
                reply.worker_id
            );
            match reply.payload {
                ReplyPayload::Ack(acked) => assert_eq!(
                    acked, kind,
                    "worker {} acknowledged the wrong request",
                    reply.worker_id
                ),
                ReplyPayload::TaskResult(_) => panic!(
                    "unexpected task result from worker {} during a {kind:?} broadcast",
                    reply.worker_id
                ),
            }
            worker.pending = 0;
        }
        log_debug!("[master] {kind:?} broadcast acknowledged by all workers");
    }

    /// Retires and joins every worker. Requires quiescence.
    fn retire_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.notify_all_workers(RequestKind::Retire, || Request::Retire);
        self.idle_workers.clear();
        for (_worker_id, handle) in self.workers.drain(..).enumerate() {
            drop(handle.mailbox);
            match handle.thread.join() {
                Ok(()) => log_debug!("[master] worker {_worker_id} retired"),
                Err(_) => log_error!("[master] worker {_worker_id} panicked before retiring"),
            }
        }
    }

    fn manage_tasks(
        &mut self,
        limit: TaskLimit,
        work: &ErasedWorkFn,
        provide: &mut dyn FnMut() -> Provided<Payload>,
        consume: &mut dyn FnMut(Payload),
        cancel: Option<&CancelToken>,
    ) -> Result<(), MasterError> {
        if self.workers.is_empty() {
            log_error!("no worker threads are available");
            return Err(MasterError::NoWorkers);
        }
        assert_eq!(
            self.active_tasks, 0,
            "manage_tasks entered with tasks in flight"
        );
        if cancel_requested(cancel) {
            return Err(MasterError::Cancelled);
        }

        if !self
            .work
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, work))
        {
            log_debug!("[master] installing a new work function");
            self.notify_all_workers(RequestKind::SetWork, || Request::SetWork(Arc::clone(work)));
            self.work = Some(Arc::clone(work));
        }
        debug_assert_eq!(self.idle_workers.len(), self.workers.len());
        if cancel_requested(cancel) {
            return Err(MasterError::Cancelled);
        }

        let limit = limit.effective(self.workers.len());
        let mut exhausted = false;
        let mut cancelled = false;
        let mut aborted = false;

        while !(exhausted || cancelled || aborted) || self.active_tasks > 0 {
            // Obtain new tasks if we can and send them to idle workers.
            if !(exhausted || cancelled || aborted) {
                while self.active_tasks < limit {
                    match provide() {
                        Provided::Exhausted => {
                            exhausted = true;
                            break;
                        }
                        Provided::TryAgain => {
                            if self.active_tasks == 0 {
                                log_error!(
                                    "the task provider returned TryAgain with no tasks in flight; aborting"
                                );
                                aborted = true;
                            }
                            break;
                        }
                        Provided::Task(task) => self.dispatch(task),
                    }
                }
            }
            if self.active_tasks == 0 {
                break;
            }

            // Collect results: block for one, then drain whatever else has
            // already arrived.
            let mut reply = self
                .reply_rx
                .recv()
                .expect("all workers disconnected while tasks were in flight");
            loop {
                self.collect(reply, consume);
                if self.active_tasks == 0 {
                    break;
                }
                match self.reply_rx.try_recv() {
                    Ok(next) => reply = next,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        panic!("all workers disconnected while tasks were in flight")
                    }
                }
            }

            if cancel_requested(cancel) {
                cancelled = true;
            }
        }

        assert_eq!(self.active_tasks, 0);
        debug_assert_eq!(self.idle_workers.len(), self.workers.len());

        if aborted {
            Err(MasterError::TryAgainWithoutTasks)
        } else if cancelled {
            Err(MasterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sends one task to an idle worker.
    fn dispatch(&mut self, task: Payload) {
        let worker_id = self
            .idle_workers
            .pop()
            .expect("no idle worker despite the in-flight bound");
        self.task_id += 1;
        self.active_tasks += 1;
        let task_id = self.task_id;
        let worker = &mut self.workers[worker_id];
        debug_assert_eq!(worker.pending, 0);
        worker.pending = task_id;
        worker
            .mailbox
            .send(Command {
                worker_id,
                task_id,
                request: Request::Task(task),
            })
            .expect("a worker mailbox disconnected");
        log_debug!("[master] sent task {task_id} to worker {worker_id}");
    }

    /// Books one task result back in and hands it to the consumer.
    fn collect(&mut self, reply: Reply, consume: &mut dyn FnMut(Payload)) {
        let Reply {
            worker_id,
            task_id,
            payload,
        } = reply;
        assert!(
            worker_id < self.workers.len(),
            "result from unknown worker {worker_id}"
        );
        let worker = &mut self.workers[worker_id];
        assert_eq!(
            task_id, worker.pending,
            "task identifier mismatch from worker {worker_id}"
        );
        let result = match payload {
            ReplyPayload::TaskResult(result) => result,
            ReplyPayload::Ack(kind) => panic!(
                "unexpected {kind:?} acknowledgement from worker {worker_id} while collecting results"
            ),
        };
        worker.pending = 0;
        assert!(self.active_tasks > 0);
        self.active_tasks -= 1;
        self.idle_workers.push(worker_id);
        log_debug!("[master] collected task {task_id} from worker {worker_id}");

        match result {
            Some(result) => consume(result),
            None => {
                log_error!("[master] worker {worker_id} produced no result for task {task_id}");
                panic!("worker {worker_id} failed to produce a result for task {task_id}");
            }
        }
    }

    fn create_data(&mut self, factory: ErasedDataFactory) -> Result<(), MasterError> {
        if self.workers.is_empty() {
            log_error!("no worker threads are available");
            return Err(MasterError::NoWorkers);
        }
        self.notify_all_workers(RequestKind::CreateData, || {
            Request::CreateData(Arc::clone(&factory))
        });
        Ok(())
    }

    fn destroy_data(&mut self, destructor: ErasedDataDestructor) -> Result<(), MasterError> {
        if self.workers.is_empty() {
            log_error!("no worker threads are available");
            return Err(MasterError::NoWorkers);
        }
        self.notify_all_workers(RequestKind::DestroyData, || {
            Request::DestroyData(Arc::clone(&destructor))
        });
        Ok(())
    }
}

impl Drop for ThreadedMaster {
    /// Retires all workers and joins their threads.
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        if std::thread::panicking() {
            // The retire barrier cannot be trusted mid-unwind; closing the
            // mailboxes makes every worker exit on its own.
            for (_worker_id, handle) in self.workers.drain(..).enumerate() {
                drop(handle.mailbox);
                if handle.thread.join().is_err() {
                    log_error!("[master] worker {_worker_id} panicked");
                }
            }
            return;
        }
        debug_assert_eq!(self.active_tasks, 0);
        self.retire_workers();
    }
}
