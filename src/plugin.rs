use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    application::AppConfig,
    configs::Package,
    dependency_injection::{Injector, Module},
    plugins::{odm::OdmPlugin, telemetry::TelemetryPlugin},
    web::WebApp,
};

/// What a plugin may see of the application it is plugged into.
pub trait ApplicationView: Send + Sync {
    fn package(&self) -> &Package;

    fn config(&self) -> Arc<dyn AppConfig>;

    fn web_app(&self) -> &Arc<WebApp>;

    /// `None` until an injector has been attached to the application.
    fn injector(&self) -> Option<Arc<Injector>>;
}

/// An optional capability activated by name from the `plugins` section of
/// `application.yaml`.
///
/// Hooks run in activation order. `on_load` runs once the injector is
/// attached; `on_startup` and `on_shutdown` bracket request serving.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The name used in the activation list.
    fn name(&self) -> &str;

    /// Bindings this plugin contributes to the application injector.
    fn module(&self) -> Option<Arc<dyn Module>> {
        None
    }

    /// Returning false refuses activation and aborts application construction.
    fn pre_conditions_check(&self, _application: &dyn ApplicationView) -> bool {
        true
    }

    fn on_load(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_startup(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The plugins an application can activate, by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins shipped with this crate.
    pub fn with_builtins() -> Self {
        Self::new()
            .with(Arc::new(OdmPlugin))
            .with(Arc::new(TelemetryPlugin))
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        let name = plugin.name().to_owned();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!("Plugin `{name}` registered twice, keeping the last one");
        }
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn resolves_registered_plugins() {
        let registry = PluginRegistry::new()
            .with(Arc::new(Named("b")))
            .with(Arc::new(Named("a")));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(registry.resolve("a").unwrap().name(), "a");
        assert!(registry.resolve("c").is_none());
    }

    #[test]
    fn builtins_include_shipped_plugins() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["odm", "telemetry"]);
    }
}
