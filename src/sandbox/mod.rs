//! Capability boundary between the core and plugin code.
//!
//! A plugin only ever sees three things: the platform runtime, the symbols
//! the host exports under whitelisted shared-API prefixes, and the symbols
//! defined by its own packaged [`Unit`]. Every symbol a plugin asks for goes
//! through [`Sandbox::resolve`], which decides where it comes from or why it
//! can't be seen.

mod discovery;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::IsolationError;

pub use discovery::{
    Discovered, Extension, ExtensionCatalog, MANIFEST, Manifest, PluginFactory,
};

/// The narrow parent scope shared by every sandbox of a host.
#[derive(Debug, Clone, Default)]
pub struct SharedScope {
    platform: Vec<ArcStr>,
    whitelist: Vec<ArcStr>,
    exported: HashSet<ArcStr>,
}

impl SharedScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbols starting with `prefix` belong to the platform runtime and are
    /// visible to every plugin.
    pub fn with_platform(mut self, prefix: impl Into<ArcStr>) -> Self {
        self.platform.push(prefix.into());
        self
    }

    /// Symbols starting with `prefix` form the shared API. They can only be
    /// provided by the host, never by a plugin.
    pub fn with_shared_api(mut self, prefix: impl Into<ArcStr>) -> Self {
        self.whitelist.push(prefix.into());
        self
    }

    /// Makes `symbol` available through the shared API.
    pub fn export(mut self, symbol: impl Into<ArcStr>) -> Self {
        self.exported.insert(symbol.into());
        self
    }

    pub fn is_platform(&self, symbol: &str) -> bool {
        self.platform.iter().any(|prefix| symbol.starts_with(&**prefix))
    }

    pub fn is_shared_api(&self, symbol: &str) -> bool {
        self.whitelist.iter().any(|prefix| symbol.starts_with(&**prefix))
    }

    pub fn exports(&self, symbol: &str) -> bool {
        self.exported.contains(symbol)
    }
}

/// The packaged code of a single plugin.
#[derive(Debug, Clone)]
pub struct Unit {
    name: ArcStr,
    defines: BTreeSet<ArcStr>,
}

impl Unit {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self {
            name: name.into(),
            defines: BTreeSet::new(),
        }
    }

    pub fn with_defines<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        self.defines.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defines(&self, symbol: &str) -> bool {
        self.defines.contains(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &ArcStr> {
        self.defines.iter()
    }
}

/// Where a resolved symbol comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Shared,
    Platform,
    Unit,
}

/// One plugin's view of the world: the shared scope with its own unit layered
/// on top.
#[derive(Debug, Clone)]
pub struct Sandbox {
    shared: Arc<SharedScope>,
    unit: Unit,
}

impl Sandbox {
    /// Fails if the unit ships its own copy of a shared-API symbol, which
    /// would leave two divergent definitions of the same API around.
    pub fn new(shared: Arc<SharedScope>, unit: Unit) -> Result<Self, IsolationError> {
        if let Some(symbol) = unit.symbols().find(|symbol| shared.is_shared_api(symbol)) {
            return Err(IsolationError::ApiCollision {
                class: symbol.clone(),
                plugin: unit.name.clone(),
            });
        }

        Ok(Self { shared, unit })
    }

    pub fn plugin(&self) -> &str {
        self.unit.name()
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn shared(&self) -> &SharedScope {
        &self.shared
    }

    /// Resolves `symbol` as seen from inside the plugin.
    ///
    /// Shared-API names are looked up in the shared scope only. Everything
    /// else has to be platform code or part of the plugin's own unit; any
    /// other name is denied even if some other unit defines it.
    pub fn resolve(&self, symbol: &str) -> Result<Origin, IsolationError> {
        if self.shared.is_shared_api(symbol) {
            // Rejected in `Sandbox::new`, the unit can't shadow shared names.
            debug_assert!(!self.unit.defines(symbol));
            if !self.shared.exports(symbol) {
                return Err(self.error(symbol, |class, plugin| IsolationError::NotFound {
                    class,
                    plugin,
                }));
            }
            return Ok(Origin::Shared);
        }

        if self.shared.is_platform(symbol) {
            return Ok(Origin::Platform);
        }

        if self.unit.defines(symbol) {
            return Ok(Origin::Unit);
        }

        tracing::warn!(plugin = %self.unit.name, symbol, "access denied");
        Err(self.error(symbol, |class, plugin| IsolationError::AccessDenied {
            class,
            plugin,
        }))
    }

    fn error(
        &self,
        symbol: &str,
        make: impl FnOnce(ArcStr, ArcStr) -> IsolationError,
    ) -> IsolationError {
        make(symbol.into(), self.unit.name.clone())
    }
}
