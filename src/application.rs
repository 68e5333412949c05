use std::sync::{Arc, OnceLock, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::{
    configs::{from_str_or_value, Package},
    dependency_injection::Injector,
    error::ApplicationError,
    health_endpoint,
    plugin::{ApplicationView, PluginRegistry},
    plugin_manager::PluginManager,
    web::{Lifespan, WebApp, WebAppMetadata},
};

/// Section of `application.yaml` holding the [`ApplicationConfig`].
pub const APPLICATION_CONFIG_KEY: &str = "application";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// The `application` section of `application.yaml`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "from_str_or_value")]
    pub port: u16,
    #[serde(default)]
    pub root_path: String,
    #[serde(default, deserialize_with = "from_str_or_value")]
    pub debug: bool,
    pub environment: Environment,
}

fn default_version() -> String {
    "0.0.0".into()
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

impl ApplicationConfig {
    pub fn new(title: impl Into<String>, environment: Environment) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            version: default_version(),
            host: default_host(),
            port: default_port(),
            root_path: String::new(),
            debug: false,
            environment,
        }
    }

    pub fn web_app_metadata(&self) -> WebAppMetadata {
        WebAppMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            root_path: self.root_path.clone(),
            debug: self.debug,
        }
    }
}

/// Implemented by application configuration models. Concrete applications
/// usually embed an [`ApplicationConfig`] and add their own fields.
pub trait AppConfig: Send + Sync + 'static {
    fn application(&self) -> &ApplicationConfig;
}

impl AppConfig for ApplicationConfig {
    fn application(&self) -> &ApplicationConfig {
        self
    }
}

/// A concrete application built on [`BaseApplication`].
///
/// ```ignore
/// struct Books {
///     base: BaseApplication,
/// }
///
/// impl Application for Books {
///     type Config = ApplicationConfig;
///
///     fn package_resource() -> Package {
///         Package::new("books")
///     }
///
///     fn new(config: Arc<ApplicationConfig>) -> Result<Self, ApplicationError> {
///         Ok(Self { base: BaseApplication::new::<Self>(config)? })
///     }
///
///     fn base(&self) -> &BaseApplication {
///         &self.base
///     }
/// }
/// ```
pub trait Application: Send + Sync + Sized + 'static {
    type Config: AppConfig + DeserializeOwned;

    /// The package holding `application.yaml`. Must have a non-empty name.
    fn package_resource() -> Package;

    /// The plugins this application may activate.
    fn plugins() -> PluginRegistry {
        PluginRegistry::with_builtins()
    }

    fn new(config: Arc<Self::Config>) -> Result<Self, ApplicationError>;

    fn base(&self) -> &BaseApplication;
}

impl<A: Application> ApplicationView for A {
    fn package(&self) -> &Package {
        self.base().package()
    }

    fn config(&self) -> Arc<dyn AppConfig> {
        self.base().config()
    }

    fn web_app(&self) -> &Arc<WebApp> {
        self.base().web_app()
    }

    fn injector(&self) -> Option<Arc<Injector>> {
        self.base().injector()
    }
}

/// State shared between the application and its lifespan.
pub struct ApplicationContext {
    package: Package,
    config: Arc<dyn AppConfig>,
    web_app: Arc<WebApp>,
    injector: OnceLock<Arc<Injector>>,
}

impl ApplicationView for ApplicationContext {
    fn package(&self) -> &Package {
        &self.package
    }

    fn config(&self) -> Arc<dyn AppConfig> {
        self.config.clone()
    }

    fn web_app(&self) -> &Arc<WebApp> {
        &self.web_app
    }

    fn injector(&self) -> Option<Arc<Injector>> {
        self.injector.get().cloned()
    }
}

/// Wires a configuration, an http application and the activated plugins
/// together.
pub struct BaseApplication {
    context: Arc<ApplicationContext>,
    plugin_manager: Arc<PluginManager>,
}

impl BaseApplication {
    pub fn new<A: Application>(config: Arc<A::Config>) -> Result<Self, ApplicationError> {
        Self::with_plugins(A::package_resource(), config, &A::plugins())
    }

    /// Fails before touching the filesystem when the package name is unset.
    pub fn with_plugins(
        package: Package,
        config: Arc<dyn AppConfig>,
        registry: &PluginRegistry,
    ) -> Result<Self, ApplicationError> {
        if package.is_unset() {
            return Err(ApplicationError::PackageNameUnset);
        }
        let web_app = Arc::new(WebApp::new(config.application().web_app_metadata()));
        web_app.include_router(health_endpoint::sys_router());

        let context = Arc::new(ApplicationContext {
            package,
            config,
            web_app,
            injector: OnceLock::new(),
        });
        let plugin_manager = Arc::new(PluginManager::new(context.as_ref(), registry)?);
        context.web_app.set_lifespan(Arc::new(PluginLifespan {
            context: Arc::downgrade(&context),
            plugin_manager: plugin_manager.clone(),
        }));
        info!(
            "Application `{}` ready with plugins {:?}",
            context.config.application().title,
            plugin_manager.activation_list().activate
        );
        Ok(Self {
            context,
            plugin_manager,
        })
    }

    /// Stores the injector for plugins and request handlers, then loads the
    /// activated plugins. Only the first call is accepted.
    pub fn attach_injector(&self, injector: Arc<Injector>) -> Result<(), ApplicationError> {
        self.context
            .injector
            .set(injector.clone())
            .map_err(|_| ApplicationError::InjectorAlreadyAttached)?;
        self.context.web_app.set_injector(injector);
        self.plugin_manager.on_load(self.context.as_ref())?;
        Ok(())
    }

    pub fn package(&self) -> &Package {
        &self.context.package
    }

    pub fn config(&self) -> Arc<dyn AppConfig> {
        self.context.config.clone()
    }

    pub fn web_app(&self) -> &Arc<WebApp> {
        &self.context.web_app
    }

    pub fn injector(&self) -> Option<Arc<Injector>> {
        self.context.injector()
    }

    pub fn plugin_manager(&self) -> &PluginManager {
        &self.plugin_manager
    }
}

struct PluginLifespan {
    context: Weak<ApplicationContext>,
    plugin_manager: Arc<PluginManager>,
}

impl PluginLifespan {
    fn context(&self) -> anyhow::Result<Arc<ApplicationContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| anyhow!("the application was dropped"))
    }
}

#[async_trait]
impl Lifespan for PluginLifespan {
    async fn startup(&self) -> anyhow::Result<()> {
        let context = self.context()?;
        self.plugin_manager.on_startup(context.as_ref()).await?;
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let context = self.context()?;
        self.plugin_manager.on_shutdown(context.as_ref()).await?;
        Ok(())
    }
}
