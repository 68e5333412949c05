use std::{collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    configs::{build_config_from_file_in_package, ConfigError, APPLICATION_CONFIG_FILENAME},
    error::LogError,
    plugin::{ApplicationView, Plugin, PluginRegistry},
};

/// Section of `application.yaml` holding the activation list.
pub const PLUGINS_CONFIG_KEY: &str = "plugins";

/// Names of the plugins to activate, in activation order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PluginsActivationList {
    #[serde(default)]
    pub activate: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleStage {
    Load,
    Startup,
    Shutdown,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleStage::Load => "load",
            LifecycleStage::Startup => "startup",
            LifecycleStage::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginManagerError {
    #[error("the package name must be set in the concrete application")]
    PackageNameUnset,
    #[error("unable to build the plugins activation list: {0}")]
    ActivationList(#[source] ConfigError),
    #[error("plugin `{plugin}` is not registered")]
    UnknownPlugin { plugin: String },
    #[error("plugin `{plugin}` is activated more than once")]
    DuplicatePlugin { plugin: String },
    #[error("the plugin `{plugin}` does not meet the pre-conditions")]
    PreConditionsNotMet { plugin: String },
    #[error("plugin `{plugin}` failed on {stage}: {source:#}")]
    Hook {
        plugin: String,
        stage: LifecycleStage,
        #[source]
        source: anyhow::Error,
    },
}

/// Activates the plugins listed in the application configuration and drives
/// their lifecycle hooks, one plugin at a time in activation order.
pub struct PluginManager {
    activation_list: PluginsActivationList,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    /// Reads the activation list from the application package.
    pub fn new(
        application: &dyn ApplicationView,
        registry: &PluginRegistry,
    ) -> Result<Self, PluginManagerError> {
        let package = application.package();
        if package.is_unset() {
            return Err(PluginManagerError::PackageNameUnset);
        }
        let activation_list = build_config_from_file_in_package(
            package,
            APPLICATION_CONFIG_FILENAME,
            PLUGINS_CONFIG_KEY,
        )
        .map_err(PluginManagerError::ActivationList)?;
        Self::from_activation_list(application, registry, activation_list)
    }

    pub fn from_activation_list(
        application: &dyn ApplicationView,
        registry: &PluginRegistry,
        activation_list: PluginsActivationList,
    ) -> Result<Self, PluginManagerError> {
        let mut seen = HashSet::new();
        let mut plugins = Vec::with_capacity(activation_list.activate.len());
        for name in &activation_list.activate {
            if !seen.insert(name.as_str()) {
                return Err(PluginManagerError::DuplicatePlugin {
                    plugin: name.clone(),
                });
            }
            let plugin = registry
                .resolve(name)
                .ok_or_else(|| PluginManagerError::UnknownPlugin {
                    plugin: name.clone(),
                })?;
            if !plugin.pre_conditions_check(application) {
                return Err(PluginManagerError::PreConditionsNotMet {
                    plugin: name.clone(),
                });
            }
            info!("Activated plugin `{name}`");
            plugins.push(plugin);
        }
        Ok(Self {
            activation_list,
            plugins,
        })
    }

    pub fn activation_list(&self) -> &PluginsActivationList {
        &self.activation_list
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn on_load(&self, application: &dyn ApplicationView) -> Result<(), PluginManagerError> {
        for plugin in &self.plugins {
            debug!("Loading plugin `{}`", plugin.name());
            plugin
                .on_load(application)
                .map_err(|source| hook_error(plugin.as_ref(), LifecycleStage::Load, source))
                .log_passthrough()?;
        }
        Ok(())
    }

    pub async fn on_startup(
        &self,
        application: &dyn ApplicationView,
    ) -> Result<(), PluginManagerError> {
        for plugin in &self.plugins {
            debug!("Starting plugin `{}`", plugin.name());
            plugin
                .on_startup(application)
                .await
                .map_err(|source| hook_error(plugin.as_ref(), LifecycleStage::Startup, source))
                .log_passthrough()?;
        }
        Ok(())
    }

    pub async fn on_shutdown(
        &self,
        application: &dyn ApplicationView,
    ) -> Result<(), PluginManagerError> {
        for plugin in &self.plugins {
            debug!("Shutting down plugin `{}`", plugin.name());
            plugin
                .on_shutdown(application)
                .await
                .map_err(|source| hook_error(plugin.as_ref(), LifecycleStage::Shutdown, source))
                .log_passthrough()?;
        }
        Ok(())
    }
}

fn hook_error(plugin: &dyn Plugin, stage: LifecycleStage, source: anyhow::Error) -> PluginManagerError {
    PluginManagerError::Hook {
        plugin: plugin.name().to_owned(),
        stage,
        source,
    }
}
