//! Resolves requested targets against a sealed [`Build`] and executes them
//! on a bounded worker pool.
//!
//! A run moves through `Configuring -> Resolving -> Running` and ends in
//! either `Completed` or `Failed`. Resolution errors (unknown targets, cycles)
//! abort before any body is invoked and are returned as [`EngineError`]. Task
//! failures never abort the call: they end up in the [`ExecutionReport`],
//! together with whatever else finished.

mod report;
mod runner;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::blueprint::Build;
use crate::core::BuildConfig;
use crate::error::EngineError;
use crate::fingerprint::FingerprintCache;

pub use report::{ExecutionReport, ExecutionStatus, SkipReason, TaskStatus};

/// State of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Configuring,
    Resolving,
    Running,
    Completed,
    Failed,
}

/// Executes builds. One engine can run any number of builds one after
/// another; the worker pool and the fingerprint cache are shared by all runs.
#[derive(Debug)]
pub struct Engine {
    config: BuildConfig,
    fingerprints: FingerprintCache,
    pool: ThreadPool,
}

impl Engine {
    pub fn new(config: BuildConfig) -> Result<Self, EngineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers())
            .thread_name(|index| format!("kiln-worker-{index}"))
            .build()?;

        Ok(Self {
            config,
            fingerprints: FingerprintCache::new(),
            pool,
        })
    }

    /// Reuses fingerprints recorded by another engine.
    pub fn with_fingerprints(mut self, fingerprints: FingerprintCache) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn fingerprints(&self) -> &FingerprintCache {
        &self.fingerprints
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `targets` and everything they depend on, blocking until every
    /// started body has returned.
    pub fn run<I, S>(&self, build: &Build, targets: I) -> Result<ExecutionReport, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tracing::debug!(state = ?RunState::Resolving);
        let order = build.resolve_targets(targets)?;

        tracing::debug!(state = ?RunState::Running, tasks = order.len());
        let report = runner::run_tasks_parallel(
            runner::Run {
                build,
                config: &self.config,
                fingerprints: &self.fingerprints,
                pool: &self.pool,
            },
            order,
        )?;

        match report.state() {
            RunState::Completed => tracing::info!(
                "Build completed, {} tasks in {:.2?}",
                report.resolved_tasks().len(),
                report.elapsed()
            ),
            _ => tracing::warn!(
                "Build failed, {} of {} tasks failed",
                report.count(TaskStatus::Failed),
                report.resolved_tasks().len()
            ),
        }

        Ok(report)
    }
}
