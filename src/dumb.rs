// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! The dumb backend: the same interface as the threaded master, with all
//! work executed inline in the calling thread.

use crate::error::MasterError;
use crate::macros::{log_debug, log_error, log_warn};
use crate::message::{ErasedDataDestructor, ErasedDataFactory, ErasedWorkFn, Payload};
use crate::work::{cancel_requested, CancelToken, Provided};

/// Zero-thread fallback backend.
///
/// Carries no worker set; a single data value stands in for the per-worker
/// state. Observable behaviour matches the threaded backend for any pure
/// provider/work/consumer triple, including the error policy: a `TryAgain`
/// from the provider is always fatal here, because inline execution never
/// has tasks in flight at provision time.
pub(crate) struct DumbMaster {
    /// Whether `create_workers()` has been called.
    workers_created: bool,
    /// The single stand-in for per-worker auxiliary data.
    worker_data: Option<Payload>,
}

impl DumbMaster {
    pub(crate) fn new() -> Self {
        Self {
            workers_created: false,
            worker_data: None,
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        if self.workers_created {
            1
        } else {
            0
        }
    }

    pub(crate) fn create_workers(&mut self) -> Result<(), MasterError> {
        if self.workers_created {
            log_warn!("the master already has workers");
            return Ok(());
        }
        self.workers_created = true;
        log_debug!("[master] dumb master set up, no threads spawned");
        Ok(())
    }

    pub(crate) fn manage_tasks(
        &mut self,
        work: &ErasedWorkFn,
        provide: &mut dyn FnMut() -> Provided<Payload>,
        consume: &mut dyn FnMut(Payload),
        cancel: Option<&CancelToken>,
    ) -> Result<(), MasterError> {
        if !self.workers_created {
            log_error!("no workers have been created");
            return Err(MasterError::NoWorkers);
        }
        if cancel_requested(cancel) {
            return Err(MasterError::Cancelled);
        }

        loop {
            match provide() {
                Provided::Exhausted => return Ok(()),
                Provided::TryAgain => {
                    log_error!(
                        "the task provider returned TryAgain with no tasks in flight; aborting"
                    );
                    return Err(MasterError::TryAgainWithoutTasks);
                }
                Provided::Task(task) => {
                    let result = work(task, &mut self.worker_data);
                    consume(result);
                    if cancel_requested(cancel) {
                        return Err(MasterError::Cancelled);
                    }
                }
            }
        }
    }

    pub(crate) fn create_data(&mut self, factory: ErasedDataFactory) -> Result<(), MasterError> {
        if !self.workers_created {
            log_error!("no workers have been created");
            return Err(MasterError::NoWorkers);
        }
        self.worker_data = Some(factory());
        Ok(())
    }

    pub(crate) fn destroy_data(
        &mut self,
        destructor: ErasedDataDestructor,
    ) -> Result<(), MasterError> {
        if !self.workers_created {
            log_error!("no workers have been created");
            return Err(MasterError::NoWorkers);
        }
        if let Some(value) = self.worker_data.take() {
            destructor(value);
        }
        Ok(())
    }
}
