use std::collections::HashMap;
use std::fmt::{Display, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::style;

use crate::blueprint::Build;
use crate::core::ArcStr;
use crate::engine::RunState;
use crate::product::Product;
use crate::task::Phase;

/// Lifecycle of a single task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    NotRun,
    Running,
    Ok,
    Skipped,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Ok | TaskStatus::Skipped | TaskStatus::Failed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskStatus::NotRun => "not run",
            TaskStatus::Running => "running",
            TaskStatus::Ok => "ok",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
        })
    }
}

/// Why a task ended up [`TaskStatus::Skipped`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The body ran and reported its inputs unchanged.
    UpToDate,
    /// The body never ran because this predecessor failed.
    PredecessorFailed(ArcStr),
    /// The body never ran because the run stopped after a failure elsewhere.
    Aborted,
}

/// Terminal record of one task.
#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    pub status: TaskStatus,
    pub phase: Phase,
    pub duration: Duration,
    pub(crate) start: Option<Instant>,
    pub skip: Option<SkipReason>,
    pub error: Option<Arc<anyhow::Error>>,
}

impl ExecutionStatus {
    pub(crate) fn finished(phase: Phase, start: Instant, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Ok,
            phase,
            duration,
            start: Some(start),
            skip: None,
            error: None,
        }
    }

    pub(crate) fn up_to_date(phase: Phase, start: Instant, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Skipped,
            skip: Some(SkipReason::UpToDate),
            ..Self::finished(phase, start, duration)
        }
    }

    pub(crate) fn failed(
        phase: Phase,
        start: Instant,
        duration: Duration,
        error: anyhow::Error,
    ) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(Arc::new(error)),
            ..Self::finished(phase, start, duration)
        }
    }

    pub(crate) fn never_ran(phase: Phase, reason: SkipReason) -> Self {
        Self {
            status: TaskStatus::Skipped,
            phase,
            duration: Duration::ZERO,
            start: None,
            skip: Some(reason),
            error: None,
        }
    }

    /// When the body started, `None` if it never ran.
    pub fn started(&self) -> Option<Instant> {
        self.start
    }

    pub fn duration_nanos(&self) -> u128 {
        self.duration.as_nanos()
    }

    /// Ok, or skipped because the task was up to date.
    pub fn is_success(&self) -> bool {
        match self.status {
            TaskStatus::Ok => true,
            TaskStatus::Skipped => self.skip == Some(SkipReason::UpToDate),
            _ => false,
        }
    }
}

/// The outcome of one run: the resolved order plus the terminal status of
/// every task, in the order they finished.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub(crate) state: RunState,
    pub(crate) resolved: Vec<ArcStr>,
    pub(crate) entries: Vec<(ArcStr, ExecutionStatus)>,
    pub(crate) index: HashMap<ArcStr, usize>,
    pub(crate) products: HashMap<ArcStr, Vec<Arc<Product>>>,
    pub(crate) elapsed: Duration,
}

impl ExecutionReport {
    pub(crate) fn new(resolved: Vec<ArcStr>) -> Self {
        Self {
            state: RunState::Running,
            entries: Vec::with_capacity(resolved.len()),
            index: HashMap::with_capacity(resolved.len()),
            resolved,
            products: HashMap::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn record(&mut self, name: ArcStr, status: ExecutionStatus) {
        match self.index.get(&name) {
            Some(&position) => self.entries[position].1 = status,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, status));
            }
        }
    }

    /// Deterministic order computed before anything ran.
    pub fn resolved_tasks(&self) -> &[ArcStr] {
        &self.resolved
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn status(&self, name: &str) -> Option<&ExecutionStatus> {
        self.index.get(name).map(|&position| &self.entries[position].1)
    }

    /// Terminal statuses in the order tasks reached them.
    pub fn statuses(&self) -> impl Iterator<Item = (&ArcStr, &ExecutionStatus)> {
        self.entries.iter().map(|(name, status)| (name, status))
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ArcStr, &anyhow::Error)> {
        self.entries
            .iter()
            .filter_map(|(name, status)| status.error.as_deref().map(|error| (name, error)))
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status == status)
            .count()
    }

    /// Products published by `task` during this run.
    pub fn products(&self, task: &str) -> &[Arc<Product>] {
        self.products.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Wall-clock time of the running phase.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Sum of the time spent inside task bodies.
    pub fn total_duration(&self) -> Duration {
        self.entries.iter().map(|(_, status)| status.duration).sum()
    }

    /// Renders the executed part of `build` as a Mermaid diagram colour-coded
    /// by status.
    ///
    /// * **Green**: Ok
    /// * **Blue**: Up to date
    /// * **Grey**: Never ran
    /// * **Red**: Failed
    pub fn render_mermaid(&self, build: &Build) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let ids: HashMap<&ArcStr, usize> = self
            .resolved
            .iter()
            .enumerate()
            .map(|(id, name)| (name, id))
            .collect();

        for (id, name) in self.resolved.iter().enumerate() {
            let label = name.replace('"', "\\\"");

            let (extra, colour) = match self.status(name) {
                Some(entry) => match (entry.status, &entry.skip) {
                    (TaskStatus::Ok, _) => (format!("{:.2?}", entry.duration), "#90EE90"),
                    (TaskStatus::Failed, _) => ("failed".to_string(), "#F08080"),
                    (_, Some(SkipReason::UpToDate)) => ("up to date".to_string(), "#ADD8E6"),
                    _ => ("skipped".to_string(), "#D3D3D3"),
                },
                None => ("pending".to_string(), "#FFFFFF"),
            };

            let _ = writeln!(f, "    {id}[\"{label}\\n{extra}\"]");
            let _ = writeln!(f, "    style {id} fill:{colour}");
        }

        for (dependent, dependency) in build.graph.edges() {
            if let (Some(from), Some(to)) = (ids.get(dependency), ids.get(dependent)) {
                let _ = writeln!(f, "    {from} --> {to}");
            }
        }

        f
    }
}

impl Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in &self.resolved {
            let Some(entry) = self.status(name) else {
                continue;
            };

            let status = match (entry.status, &entry.skip) {
                (TaskStatus::Ok, _) => style("ok").green(),
                (TaskStatus::Failed, _) => style("failed").red(),
                (_, Some(SkipReason::UpToDate)) => style("up to date").blue(),
                _ => style("skipped").dim(),
            };

            writeln!(
                f,
                "{:<10} {} ({}) {:.2?}",
                status, name, entry.phase, entry.duration
            )?;
        }

        let state = match self.state {
            RunState::Completed => style("Completed").green(),
            _ => style("Failed").red(),
        };

        write!(
            f,
            "{state}: {} ok, {} skipped, {} failed in {:.2?}",
            self.count(TaskStatus::Ok),
            self.count(TaskStatus::Skipped),
            self.count(TaskStatus::Failed),
            self.elapsed
        )
    }
}
