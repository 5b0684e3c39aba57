use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::{Blueprint, Build, Registry, Template};
use crate::core::{ArcStr, BuildConfig};
use crate::error::{ConfigError, DiscoveryError};
use crate::sandbox::{Extension, ExtensionCatalog, Sandbox, SharedScope};

/// Resolves external artifacts, e.g. `group:artifact:version` coordinates,
/// to files on disk.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, coordinate: &str) -> anyhow::Result<Vec<Utf8PathBuf>>;
}

/// Resolver used when the host doesn't provide one; every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl DependencyResolver for NoResolver {
    fn resolve(&self, coordinate: &str) -> anyhow::Result<Vec<Utf8PathBuf>> {
        anyhow::bail!("No dependency resolver configured, can't resolve '{coordinate}'")
    }
}

/// Everything a plugin gets to see while it configures the build.
pub struct PluginContext<'a> {
    config: &'a BuildConfig,
    span: tracing::Span,
    resolver: &'a dyn DependencyResolver,
    sandbox: Option<&'a Sandbox>,
}

impl<'a> PluginContext<'a> {
    pub fn config(&self) -> &'a BuildConfig {
        self.config
    }

    /// Logging sink named after the plugin.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn resolver(&self) -> &'a dyn DependencyResolver {
        self.resolver
    }

    /// The sandbox the plugin was loaded into, `None` for plugins added to
    /// the host directly.
    pub fn sandbox(&self) -> Option<&'a Sandbox> {
        self.sandbox
    }
}

/// A build plugin.
///
/// Plugins are configured one after another before anything runs: first
/// [`Plugin::register_tasks`] binds task bodies, then [`Plugin::wire_tasks`]
/// declares lifecycle tasks and dependencies between them.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Tasks every task of this plugin depends on.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn register_tasks(
        &self,
        context: &PluginContext<'_>,
        registry: &mut Registry<'_>,
    ) -> anyhow::Result<()>;

    fn wire_tasks(
        &self,
        _context: &PluginContext<'_>,
        _template: &mut Template<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Loaded {
    plugin: Box<dyn Plugin>,
    sandbox: Option<Sandbox>,
}

/// Owns the loaded plugins of a build and turns them into a [`Build`].
pub struct Host {
    config: BuildConfig,
    resolver: Arc<dyn DependencyResolver>,
    plugins: Vec<Loaded>,
}

impl Host {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            resolver: Arc::new(NoResolver),
            plugins: Vec::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: impl DependencyResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Adds a trusted plugin linked into the host.
    pub fn add_plugin(&mut self, plugin: impl Plugin + 'static) -> &mut Self {
        self.plugins.push(Loaded {
            plugin: Box::new(plugin),
            sandbox: None,
        });
        self
    }

    pub fn add_extension(&mut self, extension: Extension) -> &mut Self {
        self.plugins.push(Loaded {
            plugin: extension.plugin,
            sandbox: Some(extension.sandbox),
        });
        self
    }

    /// Loads extension `name` from `base`. Nothing is added if loading
    /// fails.
    pub fn load(
        &mut self,
        catalog: &ExtensionCatalog,
        base: impl AsRef<Utf8Path>,
        name: &str,
        shared: &Arc<SharedScope>,
    ) -> Result<&mut Self, DiscoveryError> {
        let extension = catalog.load(base, name, None, shared)?;
        Ok(self.add_extension(extension))
    }

    /// Names of the loaded plugins, in configuration order.
    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|loaded| loaded.plugin.name())
    }

    /// Configures every plugin in the order it was added and seals the
    /// result.
    pub fn configure(&self) -> Result<Build, ConfigError> {
        let mut blueprint = Blueprint::new();

        for Loaded { plugin, sandbox } in &self.plugins {
            let name: ArcStr = plugin.name().into();
            let context = PluginContext {
                config: &self.config,
                span: tracing::info_span!("plugin", name = %name),
                resolver: &*self.resolver,
                sandbox: sandbox.as_ref(),
            };
            let _enter = context.span.enter();

            let mut registry = blueprint
                .registry(name.clone())
                .with_predecessors(plugin.dependencies());
            plugin
                .register_tasks(&context, &mut registry)
                .map_err(|err| plugin_error(&name, err))?;

            let mut template = blueprint.template(name.clone());
            plugin
                .wire_tasks(&context, &mut template)
                .map_err(|err| plugin_error(&name, err))?;

            tracing::debug!("configured plugin");
        }

        let build = blueprint.seal()?;
        tracing::info!(
            "Configured {} plugins, {} tasks",
            self.plugins.len(),
            build.tasks().count()
        );
        Ok(build)
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("plugins", &self.plugins().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Configuration errors raised by the blueprint keep their own variant,
/// anything else the plugin returns is attributed to it.
fn plugin_error(plugin: &ArcStr, err: anyhow::Error) -> ConfigError {
    match err.downcast::<ConfigError>() {
        Ok(err) => err,
        Err(source) => ConfigError::Plugin {
            plugin: plugin.clone(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Outcome, Phase, Task};

    struct Compile;

    impl Plugin for Compile {
        fn name(&self) -> &str {
            "compile"
        }

        fn register_tasks(&self, _: &PluginContext, registry: &mut Registry) -> anyhow::Result<()> {
            registry.register(Task::new("compileMain", Phase::Compile, |_| Ok(Outcome::Done)))?;
            Ok(())
        }
    }

    struct Checkstyle;

    impl Plugin for Checkstyle {
        fn name(&self) -> &str {
            "checkstyle"
        }

        fn dependencies(&self) -> Vec<String> {
            vec!["compileMain".into()]
        }

        fn register_tasks(&self, _: &PluginContext, registry: &mut Registry) -> anyhow::Result<()> {
            registry.register(Task::new("checkstyleMain", Phase::Check, |_| Ok(Outcome::Done)))?;
            registry.register(Task::new("checkstyleTest", Phase::Check, |_| Ok(Outcome::Done)))?;
            Ok(())
        }

        fn wire_tasks(&self, _: &PluginContext, template: &mut Template) -> anyhow::Result<()> {
            let check = template.task("check");
            let main = template.task("checkstyleMain");
            let test = template.task("checkstyleTest");
            template
                .phase(&check, Phase::Lifecycle)?
                .depends_on(&check, [&main, &test])?;
            Ok(())
        }
    }

    struct Broken;

    impl Plugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn register_tasks(&self, context: &PluginContext, _: &mut Registry) -> anyhow::Result<()> {
            context.resolver().resolve("org.example:missing:1.0")?;
            Ok(())
        }
    }

    #[test]
    fn test_configure_in_order() {
        let mut host = Host::new(BuildConfig::default());
        host.add_plugin(Compile).add_plugin(Checkstyle);

        assert_eq!(host.plugins().collect::<Vec<_>>(), vec!["compile", "checkstyle"]);

        let build = host.configure().unwrap();
        let order = build.resolve("check").unwrap();
        assert_eq!(
            order.iter().map(|name| &**name).collect::<Vec<_>>(),
            vec!["compileMain", "checkstyleMain", "checkstyleTest", "check"]
        );

        let check = build.task("check").unwrap();
        assert!(check.is_marker());
        assert_eq!(check.phase(), &Phase::Lifecycle);
    }

    #[test]
    fn test_plugin_dependencies_apply_to_its_tasks() {
        let mut host = Host::new(BuildConfig::default());
        host.add_plugin(Checkstyle).add_plugin(Compile);

        let build = host.configure().unwrap();
        for name in ["checkstyleMain", "checkstyleTest"] {
            let task = build.task(name).unwrap();
            assert_eq!(task.predecessors().len(), 1);
            assert_eq!(&*task.predecessors()[0], "compileMain");
        }
        assert!(build.task("compileMain").unwrap().predecessors().is_empty());
    }

    #[test]
    fn test_missing_plugin_dependency() {
        let mut host = Host::new(BuildConfig::default());
        host.add_plugin(Checkstyle);

        assert!(matches!(
            host.configure(),
            Err(ConfigError::UnknownTask { predecessor, .. }) if &*predecessor == "compileMain"
        ));
    }

    #[test]
    fn test_duplicate_across_plugins() {
        let mut host = Host::new(BuildConfig::default());
        host.add_plugin(Compile).add_plugin(Compile);

        assert!(matches!(
            host.configure(),
            Err(ConfigError::DuplicateTask { name, .. }) if &*name == "compileMain"
        ));
    }

    #[test]
    fn test_plugin_errors_are_attributed() {
        let mut host = Host::new(BuildConfig::default());
        host.add_plugin(Compile).add_plugin(Broken);

        let err = host.configure().unwrap_err();
        assert!(matches!(&err, ConfigError::Plugin { plugin, .. } if &**plugin == "broken"));
        assert!(err.to_string().contains("org.example:missing:1.0"));
    }

    #[test]
    fn test_custom_resolver() {
        struct Local;

        impl DependencyResolver for Local {
            fn resolve(&self, coordinate: &str) -> anyhow::Result<Vec<Utf8PathBuf>> {
                Ok(vec![Utf8PathBuf::from(format!("lib/{coordinate}.jar"))])
            }
        }

        let mut host = Host::new(BuildConfig::default()).with_resolver(Local);
        host.add_plugin(Broken);

        let build = host.configure().unwrap();
        assert_eq!(build.tasks().count(), 0);
    }
}
