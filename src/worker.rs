// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! The worker thread state machine.

use crate::macros::{log_debug, log_error};
use crate::message::{Command, ErasedWorkFn, Payload, Reply, ReplyPayload, Request, RequestKind};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Main function run by a worker thread.
///
/// The worker blocks on its private mailbox and answers every command with
/// exactly one reply on the shared mailbox before reading the next command.
/// Task results and acknowledgements echo the `worker_id` and `task_id` of
/// the command they answer.
///
/// User callbacks (the work function, data factories and destructors) run
/// under `catch_unwind` so that a panicking callback cannot leave the master
/// waiting for a reply that never comes. A panicking work function is
/// reported upstream as a missing result; a panicking factory or destructor
/// is logged here and the broadcast is still acknowledged.
///
/// The worker terminates on a [`Request::Retire`], or when its mailbox
/// disconnects because the master was dropped mid-unwind. Worker-local data
/// still installed at that point is simply dropped.
pub(crate) fn worker_main(inbox: Receiver<Command>, outbox: Sender<Reply>) {
    let mut work: Option<ErasedWorkFn> = None;
    let mut data: Option<Payload> = None;

    loop {
        let Ok(command) = inbox.recv() else {
            log_debug!("[worker] mailbox disconnected, exiting");
            break;
        };
        let Command {
            worker_id,
            task_id,
            request,
        } = command;
        let kind = request.kind();

        let payload = match request {
            Request::Task(task) => {
                let result = match &work {
                    Some(work) => {
                        match catch_unwind(AssertUnwindSafe(|| work(task, &mut data))) {
                            Ok(result) => Some(result),
                            Err(_) => {
                                log_error!(
                                    "[worker {worker_id}] the work function panicked on task {task_id}"
                                );
                                None
                            }
                        }
                    }
                    None => {
                        log_error!(
                            "[worker {worker_id}] asked to run task {task_id} with no work function installed"
                        );
                        None
                    }
                };
                ReplyPayload::TaskResult(result)
            }
            Request::SetWork(new_work) => {
                work = Some(new_work);
                ReplyPayload::Ack(kind)
            }
            Request::CreateData(factory) => {
                data = match catch_unwind(AssertUnwindSafe(|| factory())) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        log_error!("[worker {worker_id}] the data factory panicked");
                        None
                    }
                };
                ReplyPayload::Ack(kind)
            }
            Request::DestroyData(destructor) => {
                if let Some(value) = data.take() {
                    if catch_unwind(AssertUnwindSafe(|| destructor(value))).is_err() {
                        log_error!("[worker {worker_id}] the data destructor panicked");
                    }
                }
                ReplyPayload::Ack(kind)
            }
            Request::Retire => ReplyPayload::Ack(kind),
        };

        if outbox
            .send(Reply {
                worker_id,
                task_id,
                payload,
            })
            .is_err()
        {
            // The master is gone; no point in reading further commands.
            break;
        }
        if kind == RequestKind::Retire {
            log_debug!("[worker {worker_id}] retired");
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{ErasedDataDestructor, ErasedDataFactory};
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn spawn_worker() -> (
        Sender<Command>,
        Receiver<Reply>,
        std::thread::JoinHandle<()>,
    ) {
        let (command_tx, command_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let handle = std::thread::spawn(move || worker_main(command_rx, reply_tx));
        (command_tx, reply_rx, handle)
    }

    fn send(commands: &Sender<Command>, task_id: u64, request: Request) {
        commands
            .send(Command {
                worker_id: 7,
                task_id,
                request,
            })
            .unwrap();
    }

    fn expect_ack(replies: &Receiver<Reply>, task_id: u64, kind: RequestKind) {
        let reply = replies.recv().unwrap();
        assert_eq!(reply.worker_id, 7);
        assert_eq!(reply.task_id, task_id);
        assert!(matches!(reply.payload, ReplyPayload::Ack(acked) if acked == kind));
    }

    #[test]
    fn test_worker_state_machine_round_trips() {
        let (commands, replies, handle) = spawn_worker();

        let work: ErasedWorkFn = Arc::new(|task, data| {
            let x = *task.downcast::<u64>().unwrap();
            let counter = data
                .as_mut()
                .map(|value| value.downcast_mut::<u64>().unwrap());
            if let Some(counter) = counter {
                *counter += 1;
            }
            Box::new(x + 1) as Payload
        });
        send(&commands, 1, Request::SetWork(work));
        expect_ack(&replies, 1, RequestKind::SetWork);

        let factory: ErasedDataFactory = Arc::new(|| Box::new(0u64) as Payload);
        send(&commands, 2, Request::CreateData(factory));
        expect_ack(&replies, 2, RequestKind::CreateData);

        send(&commands, 3, Request::Task(Box::new(41u64)));
        let reply = replies.recv().unwrap();
        assert_eq!(reply.task_id, 3);
        match reply.payload {
            ReplyPayload::TaskResult(Some(result)) => {
                assert_eq!(*result.downcast::<u64>().unwrap(), 42);
            }
            _ => panic!("expected a task result"),
        }

        // The destructor observes the count incremented by the task above.
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let seen_in_destructor = Arc::clone(&seen);
        let destructor: ErasedDataDestructor = Arc::new(move |value| {
            let count = *value.downcast::<u64>().unwrap();
            seen_in_destructor.store(count, Ordering::SeqCst);
        });
        send(&commands, 4, Request::DestroyData(destructor));
        expect_ack(&replies, 4, RequestKind::DestroyData);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        send(&commands, 5, Request::Retire);
        expect_ack(&replies, 5, RequestKind::Retire);
        handle.join().unwrap();
    }

    #[test]
    fn test_task_without_work_function_yields_no_result() {
        let (commands, replies, handle) = spawn_worker();

        send(&commands, 1, Request::Task(Box::new(1u64)));
        let reply = replies.recv().unwrap();
        assert!(matches!(reply.payload, ReplyPayload::TaskResult(None)));

        send(&commands, 2, Request::Retire);
        expect_ack(&replies, 2, RequestKind::Retire);
        handle.join().unwrap();
    }

    #[test]
    fn test_panicking_work_function_yields_no_result() {
        let (commands, replies, handle) = spawn_worker();

        let work: ErasedWorkFn = Arc::new(|_task, _data| panic!("deliberate"));
        send(&commands, 1, Request::SetWork(work));
        expect_ack(&replies, 1, RequestKind::SetWork);

        send(&commands, 2, Request::Task(Box::new(1u64)));
        let reply = replies.recv().unwrap();
        assert_eq!(reply.task_id, 2);
        assert!(matches!(reply.payload, ReplyPayload::TaskResult(None)));

        send(&commands, 3, Request::Retire);
        expect_ack(&replies, 3, RequestKind::Retire);
        handle.join().unwrap();
    }

    #[test]
    fn test_disconnected_mailbox_retires_the_worker() {
        let (commands, replies, handle) = spawn_worker();
        drop(commands);
        handle.join().unwrap();
        assert!(replies.try_recv().is_err());
    }
}
