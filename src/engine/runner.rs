use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::Build;
use crate::core::{ArcStr, BuildConfig, FailurePolicy};
use crate::engine::RunState;
use crate::engine::report::{ExecutionReport, ExecutionStatus, SkipReason, TaskStatus};
use crate::error::EngineError;
use crate::fingerprint::FingerprintCache;
use crate::product::ProductStore;
use crate::task::{Outcome, Task, TaskContext};
use crate::utils::{get_style_run, get_style_task};

/// Everything a single run borrows from the engine.
pub(crate) struct Run<'a> {
    pub build: &'a Build,
    pub config: &'a BuildConfig,
    pub fingerprints: &'a FingerprintCache,
    pub pool: &'a ThreadPool,
}

/// (position in resolved order, body result, start, duration)
type Message = (usize, anyhow::Result<Outcome>, Instant, Duration);

/// Executes `order` on the worker pool, starting each task the moment all of
/// its predecessors have succeeded.
///
/// The algorithm works as follows:
/// 1. Every task gets a counter of unfinished predecessors.
/// 2. Tasks whose counter is zero are spawned onto the pool.
/// 3. The calling thread waits on a channel for finished bodies. It is the
///    only thread touching the bookkeeping, so no further locking is needed.
/// 4. A success decrements the counters of the task's dependents and spawns
///    those that reach zero.
/// 5. A failure marks every transitive dependent as skipped. Under
///    [`FailurePolicy::FailFast`] nothing new is started afterwards, but
///    bodies already running are waited for.
/// 6. The loop ends once nothing is in flight. Tasks that never started are
///    recorded as skipped.
pub(crate) fn run_tasks_parallel(
    run: Run<'_>,
    order: Vec<ArcStr>,
) -> Result<ExecutionReport, EngineError> {
    let Run {
        build,
        config,
        fingerprints,
        pool,
    } = run;

    let total = order.len();
    let position: HashMap<&ArcStr, usize> = order
        .iter()
        .enumerate()
        .map(|(index, name)| (name, index))
        .collect();

    let mut tasks: Vec<Arc<Task>> = Vec::with_capacity(total);
    let mut counts: Vec<usize> = Vec::with_capacity(total);
    let mut direct: Vec<Vec<usize>> = Vec::with_capacity(total);
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];

    for (index, name) in order.iter().enumerate() {
        let task = build
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTarget(name.clone()))?;
        tasks.push(task);

        let mut edges = Vec::new();
        for dependency in build.graph.dependencies(name)? {
            if let Some(&dependency) = position.get(dependency) {
                dependents[dependency].push(index);
                edges.push(dependency);
            }
        }
        counts.push(edges.len());
        direct.push(edges);
    }

    let upstream: Vec<Vec<ArcStr>> = upstream_of(&direct)
        .iter()
        .map(|indices| indices.iter().map(|&i| order[i].clone()).collect())
        .collect();

    let mut report = ExecutionReport::new(order.clone());
    let mut states = vec![TaskStatus::NotRun; total];
    let products = ProductStore::default();

    if total == 0 {
        report.state = RunState::Completed;
        return Ok(report);
    }

    let root_span = tracing::span!(Level::INFO, "run", tasks = total);
    root_span.pb_set_length(total as u64);
    if let Ok(style) = get_style_run() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    // regular task style with no progress
    let pb_style = get_style_task().ok();

    let started = Instant::now();
    let (sender, receiver) = channel::<Message>();

    pool.in_place_scope(|s| {
        let tasks = &tasks;
        let upstream = &upstream;
        let products = &products;

        // A helper closure to spawn a task
        let spawn_task = |index: usize| {
            let task = tasks[index].clone();
            let upstream = upstream[index].as_slice();
            let sender = sender.clone();
            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = &**task.name());
                if let Some(style) = &pb_style {
                    span.pb_set_style(style);
                }
                span.pb_set_message(&format!("Running {}", task.name()));
                let _enter = span.enter();

                let context = TaskContext {
                    task: &task,
                    config,
                    upstream,
                    products,
                    fingerprints,
                    span: span.clone(),
                };

                let start = Instant::now();

                // A panicking body only ever touches its own context and the
                // product store, whose lock recovers from poisoning.
                let result = match catch_unwind(AssertUnwindSafe(|| task.body().run(&context))) {
                    Ok(result) => result,
                    Err(panic) => Err(panic_error(panic)),
                };

                let elapsed = start.elapsed();

                // The receiver outlives the scope, sending cannot fail.
                let _ = sender.send((index, result, start, elapsed));
            });
        };

        let mut ready: Vec<usize> = (0..total).filter(|&index| counts[index] == 0).collect();
        let mut in_flight = 0usize;
        let mut aborted = false;

        loop {
            for index in ready.drain(..) {
                if aborted {
                    continue;
                }

                tracing::debug!(task = %order[index], "starting task");
                states[index] = TaskStatus::Running;
                in_flight += 1;
                spawn_task(index);
            }

            if in_flight == 0 {
                break;
            }

            let Ok((index, result, start, duration)) = receiver.recv() else {
                break;
            };

            in_flight -= 1;
            root_span.pb_inc(1);

            let name = &order[index];
            let phase = tasks[index].phase().clone();

            match result {
                Ok(outcome) => {
                    let status = match outcome {
                        Outcome::Done => ExecutionStatus::finished(phase, start, duration),
                        Outcome::UpToDate => ExecutionStatus::up_to_date(phase, start, duration),
                    };

                    tracing::debug!(task = %name, status = %status.status, ?duration, "task finished");
                    states[index] = status.status;
                    report.record(name.clone(), status);

                    for &dependent in &dependents[index] {
                        counts[dependent] -= 1;
                        if counts[dependent] == 0 && states[dependent] == TaskStatus::NotRun {
                            ready.push(dependent);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(task = %name, "task failed: {error:#}");
                    states[index] = TaskStatus::Failed;
                    report.record(
                        name.clone(),
                        ExecutionStatus::failed(phase, start, duration, error),
                    );

                    for dependent in unreachable_after(index, &dependents, &states) {
                        states[dependent] = TaskStatus::Skipped;
                        root_span.pb_inc(1);
                        report.record(
                            order[dependent].clone(),
                            ExecutionStatus::never_ran(
                                tasks[dependent].phase().clone(),
                                SkipReason::PredecessorFailed(name.clone()),
                            ),
                        );
                    }

                    if config.failure == FailurePolicy::FailFast {
                        aborted = true;
                    }
                }
            }
        }
    });

    for (index, state) in states.iter_mut().enumerate() {
        if *state == TaskStatus::NotRun {
            *state = TaskStatus::Skipped;
            report.record(
                order[index].clone(),
                ExecutionStatus::never_ran(tasks[index].phase().clone(), SkipReason::Aborted),
            );
        }
    }

    report.products = products.take();
    report.elapsed = started.elapsed();
    report.state = if states.contains(&TaskStatus::Failed) {
        RunState::Failed
    } else {
        RunState::Completed
    };

    root_span.pb_set_message("Done");
    Ok(report)
}

/// Transitive predecessors of every task, as ascending positions in the
/// resolved order. `direct[i]` must only point below `i`, which holds for
/// any resolved order since dependencies come first.
fn upstream_of(direct: &[Vec<usize>]) -> Vec<BTreeSet<usize>> {
    let mut reach: Vec<BTreeSet<usize>> = Vec::with_capacity(direct.len());
    for edges in direct {
        let mut upstream = BTreeSet::new();
        for &dependency in edges {
            upstream.insert(dependency);
            upstream.extend(&reach[dependency]);
        }
        reach.push(upstream);
    }
    reach
}

/// Transitive dependents of `failed` that haven't started yet, in resolved
/// order.
fn unreachable_after(failed: usize, dependents: &[Vec<usize>], states: &[TaskStatus]) -> Vec<usize> {
    let mut found = Vec::new();
    let mut seen = vec![false; states.len()];
    let mut stack = dependents[failed].clone();

    while let Some(index) = stack.pop() {
        if seen[index] || states[index] != TaskStatus::NotRun {
            continue;
        }
        seen[index] = true;
        found.push(index);
        stack.extend(&dependents[index]);
    }

    found.sort_unstable();
    found
}

fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    if let Some(s) = panic.downcast_ref::<&str>() {
        anyhow::anyhow!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        anyhow::anyhow!("Task panicked: {s}")
    } else {
        anyhow::anyhow!("Task panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_after_is_transitive_and_ordered() {
        // 0 <- 2 <- 3, 1 <- 3, 0 <- 4
        let dependents = vec![vec![4, 2], vec![3], vec![3], vec![], vec![]];
        let mut states = vec![TaskStatus::NotRun; 5];
        states[0] = TaskStatus::Failed;

        assert_eq!(unreachable_after(0, &dependents, &states), vec![2, 3, 4]);

        states[4] = TaskStatus::Running;
        assert_eq!(unreachable_after(0, &dependents, &states), vec![2, 3]);
    }

    #[test]
    fn test_upstream_is_transitive_and_ordered() {
        // 0 <- 1 <- 3, 2 <- 3, 0 <- 4
        let direct = vec![vec![], vec![0], vec![], vec![1, 2], vec![0]];
        let upstream: Vec<Vec<usize>> = upstream_of(&direct)
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();

        assert_eq!(
            upstream,
            vec![vec![], vec![0], vec![], vec![0, 1, 2], vec![0]]
        );
    }

    #[test]
    fn test_upstream_of_long_chain() {
        let direct: Vec<Vec<usize>> = (0..2000)
            .map(|i| if i == 0 { vec![] } else { vec![i - 1] })
            .collect();
        let upstream = upstream_of(&direct);

        assert_eq!(upstream[1999].len(), 1999);
        assert_eq!(upstream[1999].first(), Some(&0));
        assert_eq!(upstream[1999].last(), Some(&1998));
    }

    #[test]
    fn test_panic_error_message() {
        let err = panic_error(Box::new("oops"));
        assert_eq!(err.to_string(), "Task panicked: oops");

        let err = panic_error(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "Task panicked: owned");

        let err = panic_error(Box::new(42));
        assert_eq!(err.to_string(), "Task panicked with unknown payload");
    }
}
