// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

//! The process-wide default master.
//!
//! Acquisition is exclusive and non-recursive: while one caller holds the
//! default master, further acquisitions either fail or receive a fresh dumb
//! master. This is a simple mechanism to avoid recursive parallelisation —
//! code already running under the default master that tries to parallelise
//! again gets a single-threaded master instead of a second thread herd.

use crate::macros::{log_debug, log_warn};
use crate::master::{Master, WorkerCount};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

/// The shared master, built lazily on first acquisition and never destroyed.
static DEFAULT_MASTER: OnceLock<Mutex<Master>> = OnceLock::new();

fn build_default_master() -> Master {
    let mut master = Master::new();
    if let Err(_err) = master.create_workers(WorkerCount::AvailableParallelism) {
        log_warn!(
            "cannot create workers for the default master: {_err}; \
             the default master will be dumb (single-threaded)"
        );
        master = new_dumb_with_workers();
    }
    master
}

fn new_dumb_with_workers() -> Master {
    let mut master = Master::new_dumb();
    master
        .create_workers(WorkerCount::AvailableParallelism)
        .expect("setting up a dumb master cannot fail");
    master
}

/// Acquires the process-wide default master.
///
/// The default master is built on first acquisition, with one worker per
/// available processor (falling back to a dumb master if thread creation
/// fails), and lives for the rest of the process.
///
/// Acquisition succeeds only while no one else holds the default master. On
/// contention — including an attempt to acquire it again from code already
/// running under it — the behaviour depends on `allow_dumb`: `true` yields a
/// brand-new dumb master, `false` yields `None`.
///
/// The returned [`DefaultMaster`] releases the default master when dropped.
pub fn acquire_default(allow_dumb: bool) -> Option<DefaultMaster> {
    let cell = DEFAULT_MASTER.get_or_init(|| Mutex::new(build_default_master()));
    match cell.try_lock() {
        Ok(guard) => Some(DefaultMaster {
            inner: DefaultMasterImpl::Shared(guard),
        }),
        Err(TryLockError::WouldBlock) => {
            if allow_dumb {
                log_debug!("[registry] the default master is busy, handing out a dumb fallback");
                Some(DefaultMaster {
                    inner: DefaultMasterImpl::Fallback(new_dumb_with_workers()),
                })
            } else {
                None
            }
        }
        Err(TryLockError::Poisoned(err)) => {
            panic!("the default master lock is poisoned: {err}")
        }
    }
}

/// Exclusive handle to the default master (or to its contention fallback),
/// obtained from [`acquire_default()`].
///
/// Dereferences to [`Master`]; workers are already created. Dropping the
/// handle releases the default master for other callers — a fallback dumb
/// master is simply discarded and never touches the shared lock.
pub struct DefaultMaster {
    inner: DefaultMasterImpl,
}

enum DefaultMasterImpl {
    /// The shared master; the guard is the ownership token.
    Shared(MutexGuard<'static, Master>),
    /// A dumb master handed out because the shared one was busy.
    Fallback(Master),
}

impl DefaultMaster {
    /// Returns whether this is a contention fallback rather than the shared
    /// default master.
    pub fn is_fallback(&self) -> bool {
        matches!(self.inner, DefaultMasterImpl::Fallback(_))
    }
}

impl Deref for DefaultMaster {
    type Target = Master;

    fn deref(&self) -> &Master {
        match &self.inner {
            DefaultMasterImpl::Shared(guard) => guard,
            DefaultMasterImpl::Fallback(master) => master,
        }
    }
}

impl DerefMut for DefaultMaster {
    fn deref_mut(&mut self) -> &mut Master {
        match &mut self.inner {
            DefaultMasterImpl::Shared(guard) => guard,
            DefaultMasterImpl::Fallback(master) => master,
        }
    }
}
