//! # nanosched
//!
//! Fine-grained, order-preserving parallel map/reduce for the traversal
//! engines of a genome-analysis toolkit.
//!
//! Walkers in the toolkit share one shape: pull elements (loci, reads,
//! variant sites) from an iterator, transform each one, and fold the
//! transformed values into a single accumulator. [`Scheduler`] runs the
//! transform step on a pool of worker threads while keeping the fold strictly
//! sequential, so the result is identical to a single-threaded loop whatever
//! the thread count or the order in which workers finish.
//!
//! ## Overview
//!
//! - A producer thread drains the source, tags each element with its sequence
//!   id, and pushes it into a bounded queue of `buffer_size` elements. The
//!   producer only pulls an element while fewer than `buffer_size` are in
//!   flight (queued, being transformed, or waiting to be folded), which bounds
//!   memory for any source length.
//! - `thread_count` persistent workers take elements from the queue, apply
//!   the transform, and publish the tagged result.
//! - The calling thread reduces: results that arrive early wait in a sparse
//!   buffer until every earlier result has been folded.
//! - The first failure from the source, a transform or the combine function
//!   cancels the run and is returned by `execute`.
//!
//! ## Usage
//!
//! ```rust
//! use nanosched::Scheduler;
//!
//! // Mean base quality of a handful of reads
//! let reads: Vec<Vec<u8>> = vec![b"IIIII".to_vec(), b"#####".to_vec(), b"IIII#".to_vec()];
//!
//! let mut scheduler = Scheduler::new(16, 2).unwrap();
//! let (n, total) = scheduler
//!     .execute(
//!         reads,
//!         |quals| {
//!             let sum: u64 = quals.iter().map(|q| u64::from(q - 33)).sum();
//!             Ok(sum as f64 / quals.len() as f64)
//!         },
//!         (0u64, 0.0f64),
//!         |mean, (n, total)| Ok((n + 1, total + mean)),
//!     )
//!     .unwrap();
//! assert_eq!(n, 3);
//! assert!(total > 0.0);
//! ```

mod error;
mod pool;
mod producer;
mod progress;
mod reducer;
mod scheduler;
mod tagged;
mod timer;
mod tracker;

pub mod prelude;

pub use error::{ConfigError, Error, Result, RunError, StateError};
pub use pool::{WorkerPool, WORKER_THREAD_PREFIX};
pub use producer::INPUT_THREAD_NAME;
pub use progress::{LogProgress, ProgressMonitor, PROGRESS_INTERVAL};
pub use reducer::{Reducer, ResultBuffer};
pub use scheduler::{Scheduler, SchedulerBuilder, DEFAULT_BUFFER_PER_THREAD};
pub use tagged::Tagged;
pub use timer::{Stage, StageTimes, TimingReport};
pub use tracker::ErrorTracker;

#[cfg(test)]
mod testing {

    use super::*;
    use anyhow::Result;
    use parking_lot::Mutex;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn init_logger() {
        let _ = pretty_env_logger::try_init();
    }

    /// Sleeps a few milliseconds for some elements so workers finish out of order
    fn maybe_delay(x: u64) {
        if x % 7 == 0 {
            let mut rng = SmallRng::seed_from_u64(x);
            thread::sleep(Duration::from_millis(rng.random_range(0..10)));
        }
    }

    /// Order-sensitive fold used to compare against a sequential loop
    fn rolling_hash(value: u64, acc: u64) -> anyhow::Result<u64> {
        Ok(acc.wrapping_mul(1_000_003).wrapping_add(value))
    }

    fn sequential_hash(n: u64) -> u64 {
        (0..n).fold(17, |acc, x| rolling_hash(x * 2, acc).unwrap())
    }

    #[test]
    fn test_scenario_sum_of_doubles() -> Result<()> {
        init_logger();
        let mut scheduler = Scheduler::new(1000, 4)?;
        let sum = scheduler.execute(0..10_000u64, |x| Ok(2 * x), 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(sum, 99_990_000);
        scheduler.shutdown();
        Ok(())
    }

    #[test]
    fn test_scenario_empty_source() -> Result<()> {
        let mut scheduler = Scheduler::new(10, 4)?;
        let mut n_folds = 0;
        let out = scheduler.execute(
            std::iter::empty::<u64>(),
            |x| Ok(x),
            42u64,
            |v, acc| {
                n_folds += 1;
                Ok(v + acc)
            },
        )?;
        assert_eq!(out, 42);
        assert_eq!(n_folds, 0);
        Ok(())
    }

    #[test]
    fn test_scenario_single_element() -> Result<()> {
        let mut scheduler = Scheduler::new(10, 4)?;
        let out = scheduler.execute(
            std::iter::once(String::from("chr1")),
            |contig| Ok(contig.len()),
            vec![99usize],
            |len, mut acc| {
                acc.push(len);
                Ok(acc)
            },
        )?;
        assert_eq!(out, vec![99, 4]);
        Ok(())
    }

    #[test]
    fn test_scenario_transform_error() -> Result<()> {
        init_logger();
        let mut scheduler = Scheduler::new(100, 4)?;
        let mut max_folded = None;
        let err = scheduler
            .execute(
                0..1000u64,
                |x| {
                    if x == 49 {
                        anyhow::bail!("malformed pileup at element {x}");
                    }
                    Ok(x)
                },
                0u64,
                |v, acc| {
                    max_folded = Some(v);
                    Ok(acc + v)
                },
            )
            .unwrap_err();

        let run_err = err.as_run_error().unwrap();
        assert!(matches!(run_err, RunError::Transform { seq: 49, .. }));
        assert!(run_err.cause().to_string().contains("malformed pileup"));
        assert!(max_folded.map_or(true, |v| v < 49));
        Ok(())
    }

    #[test]
    fn test_determinism_across_thread_counts() -> Result<()> {
        for buffer_size in [1, 10, 100] {
            for threads in [1, 2, 4, 8] {
                let mut scheduler = Scheduler::new(buffer_size, threads)?;
                for n in [0u64, 1, 2, 11, 100, 1000] {
                    let hash = scheduler.execute(
                        0..n,
                        |x| {
                            maybe_delay(x);
                            Ok(x * 2)
                        },
                        17u64,
                        rolling_hash,
                    )?;
                    assert_eq!(
                        hash,
                        sequential_hash(n),
                        "buffer={buffer_size} threads={threads} n={n}"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_combine_sees_strict_order() -> Result<()> {
        let mut scheduler = Scheduler::new(16, 8)?;
        let mut expected = 0u64;
        let n = scheduler.execute(
            0..2000u64,
            |x| {
                maybe_delay(x);
                Ok(x)
            },
            0u64,
            |seq, n| {
                assert_eq!(seq, expected, "combine called out of order");
                expected += 1;
                Ok(n + 1)
            },
        )?;
        assert_eq!(n, 2000);
        Ok(())
    }

    #[test]
    fn test_reuse_in_a_loop() -> Result<()> {
        let mut scheduler = Scheduler::new(10, 4)?;
        for round in 0..10u64 {
            let sum = scheduler.execute(
                0..(100 + round),
                |x| Ok(x * 2),
                0u64,
                |v, acc| Ok(v + acc),
            )?;
            let n = 100 + round;
            assert_eq!(sum, n * (n - 1));
        }
        assert!(!scheduler.is_shutdown());
        Ok(())
    }

    #[test]
    fn test_shutdown_fences_execute() -> Result<()> {
        let mut scheduler = Scheduler::new(10, 2)?;
        let total = scheduler.execute(0..10u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(total, 45);

        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
        let err = scheduler
            .execute(0..10u64, Ok, 0u64, |v, acc| Ok(v + acc))
            .unwrap_err();
        assert!(err.is_shutdown());
        Ok(())
    }

    #[test]
    fn test_input_queue_is_bounded() -> Result<()> {
        let buffer_size = 4;
        let threads = 1;
        let mut scheduler = Scheduler::new(buffer_size, threads)?;

        let pulled = Arc::new(AtomicUsize::new(0));
        let source = {
            let pulled = Arc::clone(&pulled);
            (0..1000u64).inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
        };

        // the first transform blocks until the watcher has measured the backlog
        let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(0);
        let watcher = {
            let pulled = Arc::clone(&pulled);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                let backlog = pulled.load(Ordering::SeqCst);
                drop(gate_tx);
                backlog
            })
        };

        let sum = scheduler.execute(
            source,
            move |x| {
                let _ = gate_rx.recv();
                Ok(x)
            },
            0u64,
            |v, acc| Ok(v + acc),
        )?;
        let backlog = watcher.join().unwrap();

        assert_eq!(sum, (0..1000).sum::<u64>());
        // every pulled element holds one of the buffer_size permits
        assert_eq!(backlog, buffer_size);
        Ok(())
    }

    #[test]
    fn test_slow_combine_bounds_unfolded_results() -> Result<()> {
        let buffer_size = 4;
        let threads = 2;
        let mut scheduler = Scheduler::new(buffer_size, threads)?;

        let mapped = Arc::new(AtomicUsize::new(0));
        let transform = {
            let mapped = Arc::clone(&mapped);
            move |x: u64| {
                mapped.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            }
        };

        let mut folded = 0;
        let mut max_unfolded = 0;
        let sum = scheduler.execute(0..2_000u64, transform, 0u64, |v, acc| {
            thread::sleep(Duration::from_micros(50));
            folded += 1;
            let unfolded = mapped.load(Ordering::SeqCst).saturating_sub(folded);
            max_unfolded = max_unfolded.max(unfolded);
            Ok(acc + v)
        })?;

        assert_eq!(sum, (0..2_000).sum::<u64>());
        assert!(
            max_unfolded <= buffer_size + threads,
            "{max_unfolded} results were waiting to be folded"
        );
        Ok(())
    }

    #[test]
    fn test_combine_panic_releases_run() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 4)?;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.execute(0..10_000u64, Ok, 0u64, |v, acc| {
                assert!(v != 50, "accumulator corrupted");
                Ok(acc + v)
            })
        }));
        assert!(outcome.is_err());

        // the producer and workers of the aborted run have let go of the pool
        let sum = scheduler.execute(0..100u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(sum, 4950);
        Ok(())
    }

    #[test]
    fn test_source_error_aborts_run() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 4)?;
        let source = (0u64..).map(|i| {
            if i == 10 {
                Err(anyhow::anyhow!("truncated BAM block"))
            } else {
                Ok(i)
            }
        });
        let err = scheduler
            .try_execute(source, Ok, 0u64, |v, acc| Ok(v + acc))
            .unwrap_err();
        let run_err = err.as_run_error().unwrap();
        assert!(matches!(run_err, RunError::Source { seq: 10, .. }));
        assert_eq!(run_err.cause().to_string(), "truncated BAM block");

        // the worker pool survives a failed run
        let sum = scheduler.execute(0..10u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(sum, 45);
        Ok(())
    }

    #[test]
    fn test_fallible_source_without_errors() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 2)?;
        let lines = ["chr1\t10", "chr1\t20", "chr2\t5"];
        let source = lines.into_iter().map(|line| {
            let (_, depth) = line
                .split_once('\t')
                .ok_or_else(|| anyhow::anyhow!("missing depth column"))?;
            Ok::<_, anyhow::Error>(depth.parse::<u32>()?)
        });
        let total = scheduler.try_execute(source, Ok, 0u32, |v, acc| Ok(v + acc))?;
        assert_eq!(total, 35);
        Ok(())
    }

    #[test]
    fn test_source_panic_is_reported() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 2)?;
        let mut i = 0u64;
        let source = std::iter::from_fn(move || {
            i += 1;
            assert!(i <= 5, "iterator invariant broken");
            Some(i)
        });
        let err = scheduler
            .execute(source, Ok, 0u64, |v, acc| Ok(v + acc))
            .unwrap_err();
        let run_err = err.as_run_error().unwrap();
        assert!(matches!(run_err, RunError::Source { seq: 5, .. }));
        Ok(())
    }

    #[test]
    fn test_transform_panic_is_reported() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 4)?;
        let err = scheduler
            .execute(
                0..100u64,
                |x| {
                    assert!(x != 30, "bad cigar");
                    Ok(x)
                },
                0u64,
                |v, acc| Ok(v + acc),
            )
            .unwrap_err();
        let run_err = err.as_run_error().unwrap();
        assert!(matches!(run_err, RunError::Transform { seq: 30, .. }));
        assert!(run_err.cause().to_string().contains("bad cigar"));

        // every worker is still alive
        let sum = scheduler.execute(0..100u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(sum, 4950);
        Ok(())
    }

    #[test]
    fn test_combine_error_aborts_run() -> Result<()> {
        let mut scheduler = Scheduler::new(8, 4)?;
        let err = scheduler
            .execute(0..1000u64, Ok, 0u64, |v, acc| {
                if v == 20 {
                    anyhow::bail!("accumulator overflow");
                }
                Ok(acc + v)
            })
            .unwrap_err();
        let run_err = err.as_run_error().unwrap();
        assert!(matches!(run_err, RunError::Combine { seq: 20, .. }));
        Ok(())
    }

    #[test]
    fn test_error_does_not_hang_with_slow_transforms() -> Result<()> {
        let mut scheduler = Scheduler::new(100, 8)?;
        let err = scheduler
            .execute(
                0..100_000u64,
                |x| {
                    maybe_delay(x);
                    if x == 500 {
                        anyhow::bail!("failure");
                    }
                    Ok(x)
                },
                0u64,
                |v, acc| Ok(v + acc),
            )
            .unwrap_err();
        assert_eq!(err.as_run_error().map(RunError::seq), Some(500));
        Ok(())
    }

    #[test]
    fn test_non_send_accumulator() -> Result<()> {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(4, 2)?;
        let out = scheduler.execute(
            0..5u32,
            |x| Ok(x * x),
            Rc::clone(&seen),
            |v, acc| {
                acc.borrow_mut().push(v);
                Ok(acc)
            },
        )?;
        assert!(Rc::ptr_eq(&out, &seen));
        assert_eq!(*seen.borrow(), vec![0, 1, 4, 9, 16]);
        Ok(())
    }

    #[derive(Clone, Default)]
    struct SharedProgress {
        ticks: Arc<Mutex<Vec<u64>>>,
        completed: Arc<Mutex<Vec<u64>>>,
    }
    impl ProgressMonitor for SharedProgress {
        fn progress(&mut self, n_reduced: u64, last: &dyn std::any::Any) {
            // results are the source elements themselves
            assert_eq!(last.downcast_ref::<u64>(), Some(&(n_reduced - 1)));
            self.ticks.lock().push(n_reduced);
        }
        fn on_complete(&mut self, n_reduced: u64) {
            self.completed.lock().push(n_reduced);
        }
    }

    #[test]
    fn test_progress_monitor() -> Result<()> {
        let mut scheduler = Scheduler::new(10, 4)?;
        let progress = SharedProgress::default();
        scheduler.set_progress_monitor(progress.clone());

        scheduler.execute(0..1000u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        let expected = (1..=10).map(|i| i * PROGRESS_INTERVAL).collect::<Vec<_>>();
        assert_eq!(*progress.ticks.lock(), expected);
        assert_eq!(*progress.completed.lock(), vec![1000]);

        // a second run reports from zero again
        scheduler.execute(0..150u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(progress.ticks.lock().last(), Some(&100));
        assert_eq!(*progress.completed.lock(), vec![1000, 150]);

        scheduler.clear_progress_monitor();
        scheduler.execute(0..150u64, Ok, 0u64, |v, acc| Ok(v + acc))?;
        assert_eq!(progress.completed.lock().len(), 2);
        Ok(())
    }

    #[test]
    fn test_log_progress_monitor() -> Result<()> {
        init_logger();
        let mut scheduler = Scheduler::new(10, 2)?;
        scheduler.set_progress_monitor(LogProgress::new("depth"));
        let n = scheduler.execute(0..300u64, Ok, 0u64, |_, acc| Ok(acc + 1))?;
        assert_eq!(n, 300);
        Ok(())
    }

    #[test]
    fn test_timing_accumulates() -> Result<()> {
        let mut scheduler = Scheduler::new(4, 2)?;
        scheduler.execute(
            0..6u64,
            |x| {
                thread::sleep(Duration::from_millis(2));
                Ok(x)
            },
            0u64,
            |v, acc| Ok(v + acc),
        )?;
        let report = scheduler.timing();
        assert!(report.map >= Duration::from_millis(12));
        assert!(report.total() >= report.map);
        scheduler.shutdown();
        Ok(())
    }
}
