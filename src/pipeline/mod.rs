//! Segment-processing schedulers.
//!
//! Both pipelines are driven by one thread that pops batches off a task
//! stack, hands them to a bounded [`WorkerPool`], waits for the whole batch,
//! runs every outcome through the failure classifier and checkpoints at
//! trajectory boundaries ([`CheckpointCadence`]).
//!
//! - [`construction`]: extract → deduplicate/merge → commit to the store.
//! - [`imputation`]: estimate → select → explain, store read-only.

pub mod construction;
pub mod imputation;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crate::classify::{TaskFailure, Verdict};
use crate::config::ExperimentConfig;
use crate::error::{PipelineError, PipelineResult};

/// Scheduler knobs derived from the experiment config.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Tasks popped per iteration.
    pub batch_size: usize,
    /// Threads per worker pool.
    pub workers: usize,
    pub segments_per_trajectory: usize,
    /// Retry ceiling.
    pub max_retries: u32,
    /// Workers slower than this count as timed out.
    pub task_timeout: Duration,
    pub top_k: usize,
    /// Checkpoint every this many trajectories.
    pub checkpoint_stride: u64,
    /// Trajectory count already covered when the run starts.
    pub start_tag: u64,
    /// Trajectory count at which the run is complete.
    pub end_tag: u64,
    /// Pause when an iteration made no progress.
    pub idle_backoff: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            batch_size: config.max_concurrent,
            workers: config.max_concurrent,
            segments_per_trajectory: config.segments_per_trajectory(),
            max_retries: config.max_retries,
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            top_k: config.top_k,
            checkpoint_stride: config.process_length,
            start_tag: config.check_point,
            end_tag: config.end_point,
            idle_backoff: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let zero = [
            ("batch_size", self.batch_size == 0),
            ("workers", self.workers == 0),
            ("segments_per_trajectory", self.segments_per_trajectory == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(PipelineError::InvalidSettings {
                message: format!("{name} must be > 0"),
            });
        }
        Ok(())
    }

    pub fn cadence(&self) -> CheckpointCadence {
        CheckpointCadence::new(
            self.start_tag,
            self.checkpoint_stride,
            self.end_tag,
            self.segments_per_trajectory,
        )
    }
}

/// Decides when a ledger of a given length warrants a checkpoint.
///
/// With `current = len / segments_per_trajectory`, a checkpoint is due when
/// `current` has moved past the last saved tag and reached
/// `min(last + stride, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCadence {
    last: u64,
    stride: u64,
    end: u64,
    segments_per_trajectory: usize,
}

impl CheckpointCadence {
    pub fn new(last: u64, stride: u64, end: u64, segments_per_trajectory: usize) -> Self {
        Self {
            last,
            stride,
            end,
            segments_per_trajectory: segments_per_trajectory.max(1),
        }
    }

    pub fn current(&self, ledger_len: usize) -> u64 {
        (ledger_len / self.segments_per_trajectory) as u64
    }

    pub fn due(&self, ledger_len: usize) -> Option<u64> {
        let current = self.current(ledger_len);
        let target = (self.last + self.stride).min(self.end);
        (current > self.last && current >= target).then_some(current)
    }

    /// Tag of any progress not yet saved, for the final checkpoint.
    pub fn unsaved(&self, ledger_len: usize) -> Option<u64> {
        let current = self.current(ledger_len);
        (current > self.last).then_some(current)
    }

    pub fn mark(&mut self, tag: u64) {
        self.last = tag;
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Counters of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Tasks handed to a worker, retries included.
    pub dispatched: usize,
    /// Tasks finished without dispatch (skip / empty).
    pub short_circuited: usize,
    pub accepted: usize,
    pub retried: usize,
    pub gave_up: usize,
    /// Merge batches committed to the store.
    pub merged_batches: usize,
    /// Tags written, in order.
    pub checkpoints: Vec<u64>,
}

impl PipelineReport {
    pub fn count(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Accepted => self.accepted += 1,
            Verdict::Retry => self.retried += 1,
            Verdict::GaveUp => self.gave_up += 1,
        }
    }
}

/// A bounded thread pool with batch-barrier semantics.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize, timeout: Duration) -> PipelineResult<Self> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| PipelineError::WorkerPool {
                message: e.to_string(),
            })?;
        Ok(Self { pool, timeout })
    }

    /// Run `job` on every item and wait until all of them are done.
    ///
    /// Results come back paired with their item, in input order. A panicking
    /// or overrunning job yields a [`TaskFailure`] instead of a result.
    pub fn run_batch<I, O, F>(&self, items: Vec<I>, job: F) -> Vec<(I, Result<O, TaskFailure>)>
    where
        I: Send + Sync,
        O: Send,
        F: Fn(&I) -> Result<O, TaskFailure> + Sync,
    {
        let mut slots: Vec<Option<Result<O, TaskFailure>>> = items.iter().map(|_| None).collect();
        let timeout = self.timeout;
        let job = &job;
        self.pool.scope(|scope| {
            for (item, slot) in items.iter().zip(slots.iter_mut()) {
                scope.spawn(move |_| {
                    *slot = Some(guarded(timeout, || job(item)));
                });
            }
        });
        items
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(TaskFailure::Panicked {
                        message: "worker produced no outcome".into(),
                    })
                });
                (item, outcome)
            })
            .collect()
    }

    /// Fire-and-forget submission; the caller collects results itself.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Run `f`, converting a panic or an overrun into a [`TaskFailure`].
pub fn guarded<O>(timeout: Duration, f: impl FnOnce() -> Result<O, TaskFailure>) -> Result<O, TaskFailure> {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(TaskFailure::Panicked {
            message: panic_message(payload.as_ref()),
        })
    });
    let elapsed = started.elapsed();
    if elapsed > timeout {
        return Err(TaskFailure::TimedOut {
            elapsed,
            limit: timeout,
        });
    }
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

/// Pop up to `n` items off the top of `stack`, top first.
pub(crate) fn pop_batch<T>(stack: &mut Vec<T>, n: usize) -> Vec<T> {
    let at = stack.len().saturating_sub(n);
    let mut batch = stack.split_off(at);
    batch.reverse();
    batch
}
