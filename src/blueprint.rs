use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::{ConfigError, EngineError, GraphError};
use crate::graph::Graph;
use crate::task::{Phase, Task};

/// The blueprint of a build.
///
/// Plugins describe their tasks through two views of the same blueprint: the
/// [`Registry`], which binds bodies to task names, and the [`Template`],
/// which declares lifecycle tasks and wires coarse dependencies between
/// them. Once every plugin is configured, [`Blueprint::seal`] turns the
/// blueprint into an immutable [`Build`] that the engine can execute.
///
/// # Example
///
/// ```rust
/// use kiln::{Blueprint, Outcome, Phase, Task};
///
/// let mut blueprint = Blueprint::new();
///
/// blueprint
///     .registry("java")
///     .register(Task::new("compileMain", Phase::Compile, |_| Ok(Outcome::Done)))
///     .unwrap();
///
/// let mut template = blueprint.template("lifecycle");
/// let build = template.task("build");
/// let compile = template.task("compileMain");
/// template.depends_on(&build, [&compile]).unwrap();
///
/// let build = blueprint.seal().unwrap();
/// assert_eq!(&*build.resolve("build").unwrap()[0], "compileMain");
/// ```
#[derive(Default)]
pub struct Blueprint {
    graph: Graph<ArcStr>,
    declared: HashMap<ArcStr, Declared>,
    /// Dependency edges `(task, predecessor)` in the order they were declared
    /// through either view. They become graph edges in [`Blueprint::seal`].
    wiring: Vec<(ArcStr, ArcStr)>,
}

struct Declared {
    owner: ArcStr,
    phase: Option<Phase>,
    task: Option<Task>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration surface for `plugin`.
    pub fn registry(&mut self, plugin: impl Into<ArcStr>) -> Registry<'_> {
        Registry {
            blueprint: self,
            plugin: plugin.into(),
            inherited: Vec::new(),
        }
    }

    /// Wiring surface for `plugin`.
    pub fn template(&mut self, plugin: impl Into<ArcStr>) -> Template<'_> {
        Template {
            blueprint: self,
            plugin: plugin.into(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes configuration. Declared dependencies are turned into edges
    /// here, in declaration order, so plugins may refer to tasks registered
    /// by plugins configured after them. Names declared only through the
    /// [`Template`] become marker tasks.
    pub fn seal(self) -> Result<Build, ConfigError> {
        let Blueprint {
            mut graph,
            mut declared,
            wiring,
        } = self;

        let order: Vec<ArcStr> = graph.nodes().cloned().collect();
        let mut tasks = HashMap::with_capacity(order.len());

        for name in order {
            let Some(entry) = declared.remove(&name) else {
                continue;
            };

            let task = match entry.task {
                Some(task) => task,
                None => Task::marker(name.clone(), entry.phase.unwrap_or(Phase::Lifecycle)),
            };

            tracing::trace!(task = %name, owner = %entry.owner, "sealed task");
            tasks.insert(name, Arc::new(task));
        }

        for (task, predecessor) in wiring {
            if !graph.contains(&predecessor) {
                return Err(ConfigError::UnknownTask { task, predecessor });
            }
            graph.add_edge(&task, &predecessor)?;
        }

        Ok(Build { graph, tasks })
    }

    fn declare(&mut self, plugin: &ArcStr, name: ArcStr) -> &mut Declared {
        self.graph.add_node(name.clone());
        self.declared.entry(name).or_insert_with(|| Declared {
            owner: plugin.clone(),
            phase: None,
            task: None,
        })
    }
}

/// Binds runnable bodies to task names on behalf of one plugin.
pub struct Registry<'a> {
    blueprint: &'a mut Blueprint,
    plugin: ArcStr,
    inherited: Vec<ArcStr>,
}

impl Registry<'_> {
    /// Every task registered through this registry will also depend on
    /// `predecessors`.
    pub fn with_predecessors<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        self.inherited
            .extend(predecessors.into_iter().map(Into::into));
        self
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Registers `task`. Names are unique across all plugins of a build; on
    /// failure the blueprint is left untouched.
    pub fn register(&mut self, task: Task) -> Result<TaskHandle, ConfigError> {
        let own = task.name().clone();
        let mut task = self
            .inherited
            .iter()
            .filter(|name| **name != own)
            .fold(task, |task, name| task.depends_on(name.clone()));

        task.validate()?;

        let name = task.name().clone();

        if let Some(existing) = self.blueprint.declared.get(&name)
            && existing.task.is_some()
        {
            return Err(ConfigError::DuplicateTask {
                name,
                plugin: self.plugin.clone(),
            });
        }

        let entry = self.blueprint.declare(&self.plugin, name.clone());
        if let Some(phase) = entry.phase.take() {
            task.set_phase(phase);
        }
        entry.owner = self.plugin.clone();
        let predecessors = task.predecessors().to_vec();
        entry.task = Some(task);

        self.blueprint
            .wiring
            .extend(predecessors.into_iter().map(|predecessor| (name.clone(), predecessor)));

        tracing::debug!(plugin = %self.plugin, task = %name, "registered task");
        Ok(TaskHandle(name))
    }
}

/// Declares lifecycle tasks and wires dependencies between named tasks on
/// behalf of one plugin.
pub struct Template<'a> {
    blueprint: &'a mut Blueprint,
    plugin: ArcStr,
}

impl Template<'_> {
    /// Declares `name` if no plugin has done so yet and returns its handle.
    pub fn task(&mut self, name: impl Into<ArcStr>) -> TaskHandle {
        let name = name.into();
        self.blueprint.declare(&self.plugin, name.clone());
        TaskHandle(name)
    }

    pub fn phase(&mut self, task: &TaskHandle, phase: Phase) -> Result<&mut Self, ConfigError> {
        let entry = self
            .blueprint
            .declared
            .get_mut(&task.0)
            .ok_or_else(|| GraphError::UnknownNode(task.0.clone()))?;

        match entry.task.as_mut() {
            Some(registered) => registered.set_phase(phase),
            None => entry.phase = Some(phase),
        }

        Ok(self)
    }

    /// Makes `task` depend on every handle in `predecessors`. On failure
    /// nothing is wired.
    pub fn depends_on<'h>(
        &mut self,
        task: &TaskHandle,
        predecessors: impl IntoIterator<Item = &'h TaskHandle>,
    ) -> Result<&mut Self, ConfigError> {
        let predecessors: Vec<&TaskHandle> = predecessors.into_iter().collect();

        for handle in predecessors.iter().copied().chain([task]) {
            if !self.blueprint.graph.contains(&handle.0) {
                return Err(GraphError::UnknownNode(handle.0.clone()).into());
            }
        }
        if predecessors.contains(&task) {
            return Err(ConfigError::SelfDependency(task.0.clone()));
        }

        for predecessor in predecessors {
            self.blueprint
                .wiring
                .push((task.0.clone(), predecessor.0.clone()));
            tracing::debug!(
                plugin = %self.plugin,
                task = %task.0,
                predecessor = %predecessor.0,
                "wired dependency"
            );
        }

        Ok(self)
    }
}

/// A reference to a task declared in a [`Blueprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(ArcStr);

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A sealed blueprint: the immutable task graph handed to the engine.
#[derive(Debug, Clone)]
pub struct Build {
    pub(crate) graph: Graph<ArcStr>,
    pub(crate) tasks: HashMap<ArcStr, Arc<Task>>,
}

impl Build {
    pub fn graph(&self) -> &Graph<ArcStr> {
        &self.graph
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name).map(Arc::as_ref)
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph
            .nodes()
            .filter_map(|name| self.tasks.get(name))
            .map(Arc::as_ref)
    }

    /// Dependency-ordered tasks reachable from `target`.
    pub fn resolve(&self, target: &str) -> Result<Vec<ArcStr>, EngineError> {
        let Some((name, _)) = self.tasks.get_key_value(target) else {
            return Err(EngineError::UnknownTarget(target.into()));
        };

        Ok(self.graph.resolve(name)?)
    }

    /// Union of the resolved orders of `targets`. Each target keeps its own
    /// relative order; a task shared by several targets appears where it was
    /// first emitted.
    pub fn resolve_targets<I, S>(&self, targets: I) -> Result<Vec<ArcStr>, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut order = Vec::new();

        for target in targets {
            for name in self.resolve(target.as_ref())? {
                if seen.insert(name.clone()) {
                    order.push(name);
                }
            }
        }

        Ok(order)
    }
}

impl std::fmt::Display for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let ids: HashMap<&ArcStr, usize> = self
            .graph
            .nodes()
            .enumerate()
            .map(|(id, name)| (name, id))
            .collect();

        for task in self.tasks() {
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\\n{}\"]", ids[task.name()], name, task.phase())?;
        }

        for (dependent, dependency) in self.graph.edges() {
            writeln!(f, "    {} --> {}", ids[dependency], ids[dependent])?;
        }

        Ok(())
    }
}
