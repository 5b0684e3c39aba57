#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod engine;
mod error;
pub mod fingerprint;
mod graph;
mod plugin;
mod product;
pub mod sandbox;
mod task;
mod utils;

pub use crate::blueprint::{Blueprint, Build, Registry, TaskHandle, Template};
pub use crate::core::{ArcStr, Blake3Hasher, BuildConfig, FailurePolicy, Hash32};
pub use crate::engine::{
    Engine, ExecutionReport, ExecutionStatus, RunState, SkipReason, TaskStatus,
};
pub use crate::error::*;
pub use crate::fingerprint::FingerprintCache;
pub use crate::graph::Graph;
pub use crate::plugin::{DependencyResolver, Host, NoResolver, Plugin, PluginContext};
pub use crate::product::{Product, ProductKind};
pub use crate::sandbox::{Extension, ExtensionCatalog, Origin, Sandbox, SharedScope, Unit};
pub use crate::task::{Outcome, Phase, Task, TaskBody, TaskContext, TaskResult};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
