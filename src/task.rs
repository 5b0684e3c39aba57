//! The vocabulary plugins use to declare work.
//!
//! A [`Task`] is pure data: a unique name, a [`Phase`] used for grouping, the
//! body to run, the names of tasks that must finish first and the
//! [`ProductKind`]s it produces and consumes. Scheduling happens elsewhere.

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::core::{ArcStr, BuildConfig};
use crate::error::ConfigError;
use crate::fingerprint::FingerprintCache;
use crate::product::{Product, ProductKind, ProductStore};

/// Classification of a task, used for reporting and coarse wiring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    Compile,
    Test,
    Assemble,
    Check,
    /// Aggregating tasks such as `check` or `build` that only exist to hang
    /// dependencies on.
    Lifecycle,
    Other(ArcStr),
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Compile => "compile",
            Phase::Test => "test",
            Phase::Assemble => "assemble",
            Phase::Check => "check",
            Phase::Lifecycle => "lifecycle",
            Phase::Other(name) => name,
        })
    }
}

/// How a body finished when it didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work was performed.
    Done,
    /// The body found nothing to do, e.g. because its inputs are unchanged.
    UpToDate,
}

/// Result from a single executed task body.
pub type TaskResult = anyhow::Result<Outcome>;

/// A unit of work. Bodies may be invoked from any worker thread.
pub trait TaskBody: Send + Sync {
    fn run(&self, context: &TaskContext<'_>) -> TaskResult;
}

impl<F> TaskBody for F
where
    F: for<'a> Fn(&TaskContext<'a>) -> TaskResult + Send + Sync,
{
    fn run(&self, context: &TaskContext<'_>) -> TaskResult {
        self(context)
    }
}

struct Marker;

impl TaskBody for Marker {
    fn run(&self, _: &TaskContext<'_>) -> TaskResult {
        Ok(Outcome::Done)
    }
}

/// A named, schedulable unit of build work.
///
/// # Example
///
/// ```rust
/// use kiln::{Outcome, Phase, Product, ProductKind, Task};
///
/// let task = Task::new("compileMain", Phase::Compile, |ctx| {
///     ctx.publish(Product::classes("target/classes"))?;
///     Ok(Outcome::Done)
/// })
/// .depends_on("processResources")
/// .produces(ProductKind::Classes);
///
/// assert_eq!(&**task.name(), "compileMain");
/// ```
#[derive(Clone)]
pub struct Task {
    name: ArcStr,
    phase: Phase,
    body: Arc<dyn TaskBody>,
    predecessors: Vec<ArcStr>,
    produces: BTreeSet<ProductKind>,
    consumes: BTreeSet<ProductKind>,
    marker: bool,
}

impl Task {
    pub fn new<F>(name: impl Into<ArcStr>, phase: Phase, body: F) -> Self
    where
        F: for<'a> Fn(&TaskContext<'a>) -> TaskResult + Send + Sync + 'static,
    {
        Self::with_body(name, phase, Arc::new(body))
    }

    pub fn with_body(name: impl Into<ArcStr>, phase: Phase, body: Arc<dyn TaskBody>) -> Self {
        Self {
            name: name.into(),
            phase,
            body,
            predecessors: Vec::new(),
            produces: BTreeSet::new(),
            consumes: BTreeSet::new(),
            marker: false,
        }
    }

    /// A task with a no-op body, used for lifecycle phases.
    pub fn marker(name: impl Into<ArcStr>, phase: Phase) -> Self {
        Self {
            marker: true,
            ..Self::with_body(name, phase, Arc::new(Marker))
        }
    }

    pub fn depends_on(mut self, predecessor: impl Into<ArcStr>) -> Self {
        let predecessor = predecessor.into();
        if !self.predecessors.contains(&predecessor) {
            self.predecessors.push(predecessor);
        }
        self
    }

    pub fn produces(mut self, kind: ProductKind) -> Self {
        self.produces.insert(kind);
        self
    }

    pub fn consumes(mut self, kind: ProductKind) -> Self {
        self.consumes.insert(kind);
        self
    }

    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn predecessors(&self) -> &[ArcStr] {
        &self.predecessors
    }

    pub fn produced(&self) -> &BTreeSet<ProductKind> {
        &self.produces
    }

    pub fn consumed(&self) -> &BTreeSet<ProductKind> {
        &self.consumes
    }

    pub fn is_marker(&self) -> bool {
        self.marker
    }

    pub(crate) fn body(&self) -> &Arc<dyn TaskBody> {
        &self.body
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.predecessors.contains(&self.name) {
            return Err(ConfigError::SelfDependency(self.name.clone()));
        }
        Ok(())
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("predecessors", &self.predecessors)
            .field("produces", &self.produces)
            .field("consumes", &self.consumes)
            .finish_non_exhaustive()
    }
}

/// The context passed to every task body.
pub struct TaskContext<'a> {
    pub(crate) task: &'a Task,
    pub(crate) config: &'a BuildConfig,
    /// Transitive predecessors of this task, in resolved order.
    pub(crate) upstream: &'a [ArcStr],
    pub(crate) products: &'a ProductStore,
    pub(crate) fingerprints: &'a FingerprintCache,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl TaskContext<'_> {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn phase(&self) -> &Phase {
        &self.task.phase
    }

    pub fn config(&self) -> &BuildConfig {
        self.config
    }

    pub fn fingerprints(&self) -> &FingerprintCache {
        self.fingerprints
    }

    /// Logging sink for this task.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Hands a product to downstream tasks. The kind has to be declared with
    /// [`Task::produces`].
    pub fn publish(&self, product: Product) -> anyhow::Result<Arc<Product>> {
        let kind = product.kind();
        if !self.task.produces.contains(&kind) {
            anyhow::bail!(
                "Task '{}' publishes undeclared product kind '{kind}'",
                self.task.name
            );
        }

        tracing::debug!(parent: &self.span, %kind, "published product");
        Ok(self.products.publish(&self.task.name, product))
    }

    /// Products of `kind` published by this task's predecessors, in resolved
    /// order. The kind has to be declared with [`Task::consumes`].
    pub fn consume(&self, kind: ProductKind) -> anyhow::Result<Vec<Arc<Product>>> {
        if !self.task.consumes.contains(&kind) {
            anyhow::bail!(
                "Task '{}' consumes undeclared product kind '{kind}'",
                self.task.name
            );
        }

        Ok(self.products.collect(self.upstream, kind))
    }
}
