use std::fmt::Debug;

use thiserror::Error;

use crate::core::ArcStr;

/// Errors raised by [`Graph`](crate::Graph) mutations and resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError<N: Debug> {
    #[error("Node {0:?} was never added to the graph")]
    UnknownNode(N),

    #[error("Node {0:?} cannot depend on itself")]
    SelfDependency(N),

    #[error("Cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<N> },
}

fn format_cycle<N: Debug>(cycle: &[N]) -> String {
    cycle
        .iter()
        .map(|node| format!("{node:?}"))
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors raised while plugins configure the build.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task '{name}' registered by '{plugin}' is already defined")]
    DuplicateTask { name: ArcStr, plugin: ArcStr },

    #[error("Task '{0}' declares itself as its own predecessor")]
    SelfDependency(ArcStr),

    #[error("Task '{task}' depends on unknown task '{predecessor}'")]
    UnknownTask { task: ArcStr, predecessor: ArcStr },

    #[error(transparent)]
    Graph(#[from] GraphError<ArcStr>),

    #[error("Plugin '{plugin}' failed during configuration:\n{source}")]
    Plugin {
        plugin: ArcStr,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors which abort a run before any task body is invoked.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown target task '{0}'")]
    UnknownTarget(ArcStr),

    #[error(transparent)]
    Cycle(#[from] GraphError<ArcStr>),

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Violations of the plugin isolation boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("Plugin '{plugin}' may not access '{class}'")]
    AccessDenied { class: ArcStr, plugin: ArcStr },

    #[error("Plugin '{plugin}' ships its own definition of shared API '{class}'")]
    ApiCollision { class: ArcStr, plugin: ArcStr },

    #[error("Shared API '{class}' requested by '{plugin}' is not exported by the host")]
    NotFound { class: ArcStr, plugin: ArcStr },
}

/// Errors raised while locating and loading an extension from disk.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Couldn't read extension '{name}'.\n{source}")]
    Io {
        name: ArcStr,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest for extension '{name}'.\n{source}")]
    Manifest {
        name: ArcStr,
        #[source]
        source: serde_json::Error,
    },

    #[error("Extension '{name}' is declared as '{found}' in its manifest")]
    NameMismatch { name: ArcStr, found: ArcStr },

    #[error("Extension '{name}' does not define entry point '{entry}'")]
    MissingEntryPoint { name: ArcStr, entry: ArcStr },

    #[error("No code linked for entry point '{0}'")]
    UnknownEntryPoint(ArcStr),

    #[error(transparent)]
    Isolation(#[from] IsolationError),
}
