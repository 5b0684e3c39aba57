use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::error::DiscoveryError;
use crate::plugin::Plugin;
use crate::sandbox::{Sandbox, SharedScope, Unit};

/// Name of the manifest file expected inside every extension directory.
pub const MANIFEST: &str = "plugin.json";

/// Creates a fresh instance of a plugin linked into the host.
pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Contents of `<base>/<name>/plugin.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    /// Symbols packaged in the extension.
    #[serde(default)]
    pub defines: Vec<String>,
    /// Symbols the extension needs from outside its own unit.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Default entry point.
    pub entry: String,
}

/// An extension whose manifest has been checked against the sandbox and
/// whose entry point has been instantiated.
pub struct Extension {
    pub manifest: Manifest,
    pub sandbox: Sandbox,
    pub plugin: Box<dyn Plugin>,
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("manifest", &self.manifest)
            .field("sandbox", &self.sandbox)
            .field("plugin", &self.plugin.name())
            .finish()
    }
}

/// Entry points compiled into the host, keyed by their fully qualified name.
///
/// Extensions on disk carry only a manifest; the code behind the entry point
/// it names has to be linked into the host and registered here.
#[derive(Debug, Clone, Default)]
pub struct ExtensionCatalog {
    entries: HashMap<ArcStr, PluginFactory>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: impl Into<ArcStr>, factory: PluginFactory) -> &mut Self {
        self.entries.insert(entry.into(), factory);
        self
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains_key(entry)
    }

    /// Loads extension `name` from `base`, instantiating `entry` or the
    /// manifest's default entry point.
    ///
    /// The entry point and every required symbol are resolved inside the
    /// extension's sandbox before any of its code is instantiated.
    pub fn load(
        &self,
        base: impl AsRef<Utf8Path>,
        name: &str,
        entry: Option<&str>,
        shared: &Arc<SharedScope>,
    ) -> Result<Extension, DiscoveryError> {
        let path = base.as_ref().join(name).join(MANIFEST);
        let manifest = read_manifest(&path, name)?;

        if manifest.name != name {
            return Err(DiscoveryError::NameMismatch {
                name: name.into(),
                found: manifest.name.as_str().into(),
            });
        }

        let entry: ArcStr = entry.unwrap_or(&manifest.entry).into();
        if !manifest.defines.iter().any(|symbol| **symbol == *entry) {
            return Err(DiscoveryError::MissingEntryPoint {
                name: name.into(),
                entry,
            });
        }

        let unit = Unit::new(name).with_defines(manifest.defines.iter().map(String::as_str));
        let sandbox = Sandbox::new(shared.clone(), unit)?;

        for symbol in &manifest.requires {
            let origin = sandbox.resolve(symbol)?;
            tracing::debug!(extension = name, symbol = %symbol, ?origin, "resolved requirement");
        }

        sandbox.resolve(&entry)?;

        let factory = self
            .entries
            .get(&entry)
            .ok_or_else(|| DiscoveryError::UnknownEntryPoint(entry.clone()))?;

        tracing::info!(
            "Loaded extension {} {} ({})",
            manifest.name,
            manifest.version,
            entry
        );

        Ok(Extension {
            plugin: factory(),
            manifest,
            sandbox,
        })
    }

    /// Loads every extension found directly under `base`, in name order.
    /// Directories without a manifest are ignored. An extension that fails to
    /// load ends up in [`Discovered::rejected`] and doesn't affect the others;
    /// only failing to list `base` itself is an error.
    pub fn load_all(
        &self,
        base: impl AsRef<Utf8Path>,
        shared: &Arc<SharedScope>,
    ) -> Result<Discovered, DiscoveryError> {
        let base = base.as_ref();
        let io = |source| DiscoveryError::Io {
            name: base.as_str().into(),
            source,
        };

        let mut names = Vec::new();
        for entry in base.read_dir_utf8().map_err(io)? {
            let entry = entry.map_err(io)?;
            if entry.path().join(MANIFEST).is_file() {
                names.push(entry.file_name().to_string());
            }
        }
        names.sort();

        let mut discovered = Discovered::default();
        for name in names {
            match self.load(base, &name, None, shared) {
                Ok(extension) => discovered.loaded.push(extension),
                Err(err) => {
                    tracing::warn!("Rejected extension {name}: {err}");
                    discovered.rejected.push((name, err));
                }
            }
        }

        Ok(discovered)
    }
}

/// Outcome of scanning a directory of extensions.
#[derive(Debug, Default)]
pub struct Discovered {
    pub loaded: Vec<Extension>,
    pub rejected: Vec<(String, DiscoveryError)>,
}

fn read_manifest(path: &Utf8Path, name: &str) -> Result<Manifest, DiscoveryError> {
    let text = fs::read_to_string(path).map_err(|source| DiscoveryError::Io {
        name: name.into(),
        source,
    })?;

    serde_json::from_str(&text).map_err(|source| DiscoveryError::Manifest {
        name: name.into(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::blueprint::Registry;
    use crate::error::IsolationError;
    use crate::plugin::PluginContext;
    use crate::task::{Outcome, Phase, Task};

    struct Lint;

    impl Plugin for Lint {
        fn name(&self) -> &str {
            "lint"
        }

        fn register_tasks(&self, _: &PluginContext, registry: &mut Registry) -> anyhow::Result<()> {
            registry.register(Task::new("lintMain", Phase::Check, |_| Ok(Outcome::Done)))?;
            Ok(())
        }
    }

    fn lint() -> Box<dyn Plugin> {
        Box::new(Lint)
    }

    fn shared() -> Arc<SharedScope> {
        Arc::new(
            SharedScope::new()
                .with_platform("std.")
                .with_shared_api("shared.api.")
                .export("shared.api.Task"),
        )
    }

    fn catalog() -> ExtensionCatalog {
        let mut catalog = ExtensionCatalog::new();
        catalog.register("org.lint.LintPlugin", lint);
        catalog
    }

    fn write(base: &Utf8Path, dir: &str, manifest: &str) {
        fs::create_dir_all(base.join(dir)).unwrap();
        fs::write(base.join(dir).join(MANIFEST), manifest).unwrap();
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    const LINT: &str = r#"{
        "name": "lint",
        "version": "1.2.0",
        "defines": ["org.lint.LintPlugin", "org.lint.Rules"],
        "requires": ["shared.api.Task", "std.io.File"],
        "entry": "org.lint.LintPlugin"
    }"#;

    #[test]
    fn test_load_extension() {
        let (_dir, base) = tempdir();
        write(&base, "lint", LINT);

        let extension = catalog().load(&base, "lint", None, &shared()).unwrap();
        assert_eq!(extension.manifest.version, "1.2.0");
        assert_eq!(extension.plugin.name(), "lint");
        assert_eq!(extension.sandbox.plugin(), "lint");
    }

    #[test]
    fn test_missing_manifest() {
        let (_dir, base) = tempdir();
        let err = catalog().load(&base, "lint", None, &shared()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Io { .. }));
    }

    #[test]
    fn test_malformed_manifest() {
        let (_dir, base) = tempdir();
        write(&base, "lint", r#"{ "name": "lint" }"#);

        let err = catalog().load(&base, "lint", None, &shared()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Manifest { .. }));
    }

    #[test]
    fn test_name_mismatch() {
        let (_dir, base) = tempdir();
        write(&base, "other", LINT);

        let err = catalog().load(&base, "other", None, &shared()).unwrap_err();
        assert!(matches!(err, DiscoveryError::NameMismatch { .. }));
    }

    #[test]
    fn test_entry_point_checks() {
        let (_dir, base) = tempdir();
        write(&base, "lint", LINT);

        let err = catalog()
            .load(&base, "lint", Some("org.lint.Missing"), &shared())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MissingEntryPoint { .. }));

        let err = ExtensionCatalog::new()
            .load(&base, "lint", None, &shared())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownEntryPoint(entry) if &*entry == "org.lint.LintPlugin"));
    }

    #[test]
    fn test_forbidden_requirement() {
        let (_dir, base) = tempdir();
        write(
            &base,
            "lint",
            r#"{
                "name": "lint",
                "version": "1.0.0",
                "defines": ["org.lint.LintPlugin"],
                "requires": ["core.internal.Secret"],
                "entry": "org.lint.LintPlugin"
            }"#,
        );

        let err = catalog().load(&base, "lint", None, &shared()).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Isolation(IsolationError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_load_all_in_name_order() {
        let (_dir, base) = tempdir();
        write(&base, "lint", LINT);
        write(
            &base,
            "audit",
            r#"{
                "name": "audit",
                "version": "0.1.0",
                "defines": ["org.lint.LintPlugin"],
                "entry": "org.lint.LintPlugin"
            }"#,
        );
        fs::create_dir_all(base.join("notes")).unwrap();

        let discovered = catalog().load_all(&base, &shared()).unwrap();
        let names: Vec<_> = discovered
            .loaded
            .iter()
            .map(|ext| ext.manifest.name.as_str())
            .collect();
        assert_eq!(names, vec!["audit", "lint"]);
        assert!(discovered.rejected.is_empty());
    }

    #[test]
    fn test_load_all_keeps_good_extensions() {
        let (_dir, base) = tempdir();
        write(&base, "lint", LINT);
        write(
            &base,
            "rogue",
            r#"{
                "name": "rogue",
                "version": "0.1.0",
                "defines": ["org.lint.LintPlugin", "shared.api.Task"],
                "entry": "org.lint.LintPlugin"
            }"#,
        );

        let discovered = catalog().load_all(&base, &shared()).unwrap();

        assert_eq!(discovered.loaded.len(), 1);
        assert_eq!(discovered.loaded[0].manifest.name, "lint");

        assert_eq!(discovered.rejected.len(), 1);
        let (name, err) = &discovered.rejected[0];
        assert_eq!(name, "rogue");
        assert!(matches!(
            err,
            DiscoveryError::Isolation(IsolationError::ApiCollision { .. })
        ));
    }

    #[test]
    fn test_load_all_missing_base() {
        let (_dir, base) = tempdir();
        let err = catalog().load_all(base.join("nowhere"), &shared()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Io { .. }));
    }
}
