// Copyright 2026 the taskmaster authors.
//
// Licensed under the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>. This file may not be copied,
// modified, or distributed except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod dumb;
mod error;
mod macros;
mod master;
mod message;
mod registry;
mod work;
mod worker;

pub use error::MasterError;
pub use master::{Master, TaskLimit, WorkerCount};
pub use registry::{acquire_default, DefaultMaster};
pub use work::{CancelToken, Provided, WorkFn};

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn threaded(num_workers: usize) -> Master {
        let mut master = Master::new();
        master
            .create_workers(WorkerCount::try_from(num_workers).unwrap())
            .unwrap();
        master
    }

    fn dumb() -> Master {
        let mut master = Master::new_dumb();
        master
            .create_workers(WorkerCount::AvailableParallelism)
            .unwrap();
        master
    }

    /// Provides `0..len` split into chunks of `chunk_size`.
    fn chunk_provider(len: u64, chunk_size: u64) -> impl FnMut() -> Provided<(u64, u64)> {
        let mut next = 0u64;
        move || {
            if next == len {
                Provided::Exhausted
            } else {
                let to = (next + chunk_size).min(len);
                let chunk = (next, to);
                next = to;
                Provided::Task(chunk)
            }
        }
    }

    fn chunk_sum_work() -> WorkFn<(u64, u64), u64, ()> {
        WorkFn::new(|(from, to): (u64, u64), _data: Option<&mut ()>| (from..to).sum::<u64>())
    }

    macro_rules! expand_tests {
        ( $make:expr, ) => {};
        ( $make:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($make);
            }

            expand_tests!($make, $($others)*);
        };
    }

    macro_rules! backend_tests {
        ( $mod:ident, $make:expr ) => {
            mod $mod {
                use super::*;

                expand_tests!(
                    $make,
                    test_sums_integers_in_chunks,
                    test_empty_provider_finishes_immediately,
                    test_try_again_with_no_tasks_aborts,
                    test_cancelled_before_start_skips_provider,
                    test_cancellation_drains_dispatched_tasks,
                    test_master_is_reusable_after_cancellation,
                    test_provider_is_not_called_after_exhaustion,
                    test_create_workers_twice_keeps_the_worker_count,
                    test_stages_share_worker_data_without_leaks,
                );
            }
        };
    }

    // The equivalence contract of the whole subsystem: the same suite passes
    // with one worker, several workers, and the inline dumb backend.
    backend_tests!(threaded_1, || threaded(1));
    backend_tests!(threaded_4, || threaded(4));
    backend_tests!(dumb_backend, dumb);

    fn test_sums_integers_in_chunks(make: impl Fn() -> Master) {
        let mut master = make();
        let work = chunk_sum_work();
        let mut provide = chunk_provider(1_000_000, 1_000);
        let mut total = 0u64;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &work,
                &mut provide,
                |partial: u64| total += partial,
                None,
            )
            .unwrap();
        assert_eq!(total, 499_999_500_000);
    }

    fn test_empty_provider_finishes_immediately(make: impl Fn() -> Master) {
        let mut master = make();
        let work = chunk_sum_work();
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &work,
                || Provided::Exhausted,
                |_partial: u64| panic!("nothing should be consumed"),
                None,
            )
            .unwrap();
    }

    fn test_try_again_with_no_tasks_aborts(make: impl Fn() -> Master) {
        let mut master = make();
        let work = chunk_sum_work();
        let mut calls = 0;
        let result = master.manage_tasks(
            TaskLimit::Unlimited,
            &work,
            || {
                calls += 1;
                Provided::TryAgain
            },
            |_partial: u64| panic!("no task should be dispatched"),
            None,
        );
        assert!(matches!(result, Err(MasterError::TryAgainWithoutTasks)));
        assert_eq!(calls, 1);
    }

    fn test_cancelled_before_start_skips_provider(make: impl Fn() -> Master) {
        let mut master = make();
        let work = chunk_sum_work();
        let token = CancelToken::new();
        token.cancel();
        let result = master.manage_tasks(
            TaskLimit::Unlimited,
            &work,
            || -> Provided<(u64, u64)> { panic!("the provider must not run") },
            |_partial: u64| (),
            Some(&token),
        );
        assert!(matches!(result, Err(MasterError::Cancelled)));
    }

    fn test_cancellation_drains_dispatched_tasks(make: impl Fn() -> Master) {
        let mut master = make();
        let work = WorkFn::new(|x: u64, _data: Option<&mut ()>| x);
        let token = CancelToken::new();
        let provided = Cell::new(0u64);
        let consumed = Cell::new(0u64);
        let result = master.manage_tasks(
            TaskLimit::Unlimited,
            &work,
            || {
                // An endless provider; only cancellation stops this run.
                provided.set(provided.get() + 1);
                Provided::Task(provided.get())
            },
            |_result: u64| {
                consumed.set(consumed.get() + 1);
                if consumed.get() == 3 {
                    token.cancel();
                }
            },
            Some(&token),
        );
        assert!(matches!(result, Err(MasterError::Cancelled)));
        // Every task dispatched before the cancellation was observed is
        // still consumed, and nothing is dispatched afterwards.
        assert!(consumed.get() >= 3);
        assert_eq!(consumed.get(), provided.get());
    }

    fn test_master_is_reusable_after_cancellation(make: impl Fn() -> Master) {
        let mut master = make();
        let work = chunk_sum_work();
        let token = CancelToken::new();
        let mut seen = 0u64;
        let result = master.manage_tasks(
            TaskLimit::Unlimited,
            &work,
            chunk_provider(10_000, 100),
            |_partial: u64| {
                seen += 1;
                if seen == 2 {
                    token.cancel();
                }
            },
            Some(&token),
        );
        assert!(matches!(result, Err(MasterError::Cancelled)));

        // The cancelled run was fully drained; the same master runs the
        // whole computation again from scratch.
        let mut total = 0u64;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &work,
                chunk_provider(1_000, 10),
                |partial: u64| total += partial,
                None,
            )
            .unwrap();
        assert_eq!(total, 499_500);
    }

    fn test_provider_is_not_called_after_exhaustion(make: impl Fn() -> Master) {
        let mut master = make();
        let work = WorkFn::new(|x: u64, _data: Option<&mut ()>| x);
        let mut exhausted = false;
        let mut next = 0u64;
        let mut total = 0u64;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &work,
                || {
                    assert!(!exhausted, "the provider was called after exhaustion");
                    if next == 10 {
                        exhausted = true;
                        Provided::Exhausted
                    } else {
                        next += 1;
                        Provided::Task(next)
                    }
                },
                |result: u64| total += result,
                None,
            )
            .unwrap();
        assert_eq!(total, 55);
    }

    fn test_create_workers_twice_keeps_the_worker_count(make: impl Fn() -> Master) {
        let mut master = make();
        let num_workers = master.num_workers();
        assert!(num_workers >= 1);
        master
            .create_workers(WorkerCount::try_from(8).unwrap())
            .unwrap();
        assert_eq!(master.num_workers(), num_workers);
    }

    fn test_stages_share_worker_data_without_leaks(make: impl Fn() -> Master) {
        struct Scratch {
            tasks_seen: u64,
        }

        let mut master = make();
        master.create_data(|| Scratch { tasks_seen: 0 }).unwrap();

        let doubled = WorkFn::new(|x: u64, data: Option<&mut Scratch>| {
            let scratch = data.expect("worker data must be installed");
            scratch.tasks_seen += 1;
            x * 2
        });
        let incremented = WorkFn::new(|x: u64, data: Option<&mut Scratch>| {
            let scratch = data.expect("worker data must be installed");
            scratch.tasks_seen += 1;
            x + 1
        });

        let mut next = 0u64;
        let mut total = 0u64;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &doubled,
                || {
                    if next == 100 {
                        Provided::Exhausted
                    } else {
                        next += 1;
                        Provided::Task(next - 1)
                    }
                },
                |result: u64| total += result,
                None,
            )
            .unwrap();
        assert_eq!(total, 9_900);

        // A different work function forces a SetWork broadcast between the
        // stages; the per-worker scratch must survive it untouched.
        next = 0;
        total = 0;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &incremented,
                || {
                    if next == 100 {
                        Provided::Exhausted
                    } else {
                        next += 1;
                        Provided::Task(next - 1)
                    }
                },
                |result: u64| total += result,
                None,
            )
            .unwrap();
        assert_eq!(total, 5_050);

        // Both stages together ran 200 tasks; the destructor barrier makes
        // every worker's count visible before the assertion.
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_destructor = Arc::clone(&seen);
        master
            .destroy_data(move |scratch: Scratch| {
                seen_in_destructor.fetch_add(scratch.tasks_seen, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_available_parallelism_worker_count() {
        let mut master = Master::new();
        master
            .create_workers(WorkerCount::AvailableParallelism)
            .unwrap();
        assert_eq!(
            master.num_workers(),
            std::thread::available_parallelism().unwrap().get()
        );
    }

    #[test]
    fn test_try_again_waits_for_in_flight_results() {
        // A provider with an inter-task dependency: task n+1 only becomes
        // available once the result of task n was consumed.
        let mut master = threaded(2);
        let work = WorkFn::new(|x: u64, _data: Option<&mut ()>| x);
        let sent = Cell::new(0u64);
        let consumed = Cell::new(0u64);
        let mut total = 0u64;
        master
            .manage_tasks(
                TaskLimit::Unlimited,
                &work,
                || {
                    if sent.get() == 5 {
                        Provided::Exhausted
                    } else if sent.get() == consumed.get() {
                        sent.set(sent.get() + 1);
                        Provided::Task(sent.get())
                    } else {
                        Provided::TryAgain
                    }
                },
                |result: u64| {
                    total += result;
                    consumed.set(consumed.get() + 1);
                },
                None,
            )
            .unwrap();
        assert_eq!(total, 15);
    }

    #[test]
    fn test_task_limit_bounds_in_flight_tasks() {
        let mut master = threaded(4);
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let running_in_work = Arc::clone(&running);
        let peak_in_work = Arc::clone(&peak);
        let work = WorkFn::new(move |x: u64, _data: Option<&mut ()>| {
            let now = running_in_work.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in_work.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            running_in_work.fetch_sub(1, Ordering::SeqCst);
            x
        });
        let mut next = 0u64;
        let mut count = 0u64;
        master
            .manage_tasks(
                TaskLimit::Max(NonZeroUsize::try_from(1).unwrap()),
                &work,
                || {
                    if next == 20 {
                        Provided::Exhausted
                    } else {
                        next += 1;
                        Provided::Task(next)
                    }
                },
                |_result: u64| count += 1,
                None,
            )
            .unwrap();
        assert_eq!(count, 20);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
