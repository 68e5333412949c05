use std::{marker::PhantomData, sync::Arc};

use crate::{
    application::{AppConfig, Application, APPLICATION_CONFIG_KEY},
    configs::{build_config_from_file_in_package, ConfigError, APPLICATION_CONFIG_FILENAME},
    dependency_injection::{Binder, Injector, InjectorError, Module},
    error::ApplicationError,
    plugin::ApplicationView,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigFactoryError {
    #[error("the package name must be set in the concrete application")]
    PackageNameUnset,
    #[error("unable to read the application configuration file: {0}")]
    UnableToReadConfigFile(#[source] ConfigError),
    #[error("unable to create the application configuration model: {0}")]
    ValueErrorConfig(#[source] ConfigError),
}

/// Builds the configuration of `A` from the `application` section of the
/// package's `application.yaml`.
pub fn build_generic_application_config<A: Application>() -> Result<A::Config, ConfigFactoryError> {
    let package = A::package_resource();
    if package.is_unset() {
        return Err(ConfigFactoryError::PackageNameUnset);
    }
    build_config_from_file_in_package(&package, APPLICATION_CONFIG_FILENAME, APPLICATION_CONFIG_KEY)
        .map_err(|e| match e {
            e @ ConfigError::UnableToReadConfigFile(_) => ConfigFactoryError::UnableToReadConfigFile(e),
            e @ ConfigError::ValueErrorConfig(_) => ConfigFactoryError::ValueErrorConfig(e),
        })
}

/// Binds the application `A` and its configuration `C` as singletons, both
/// under their concrete types and as `Arc<dyn ApplicationView>` /
/// `Arc<dyn AppConfig>`, and installs the modules of the plugins `A` may
/// activate.
pub struct GenericApplicationModule<A, C> {
    _marker: PhantomData<fn() -> (A, C)>,
}

impl<A, C> GenericApplicationModule<A, C> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A, C> Default for GenericApplicationModule<A, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Module for GenericApplicationModule<A, A::Config>
where
    A: Application,
{
    fn configure(&self, binder: &mut Binder) {
        binder
            .bind_singleton::<Arc<A::Config>, _>(|_| {
                Ok(Arc::new(build_generic_application_config::<A>()?))
            })
            .bind_alias::<Arc<dyn AppConfig>, Arc<A::Config>, _>(|config| {
                config as Arc<dyn AppConfig>
            })
            .bind_singleton::<Arc<A>, _>(|injector| {
                Ok(Arc::new(A::new(injector.get::<Arc<A::Config>>()?)?))
            })
            .bind_alias::<Arc<dyn ApplicationView>, Arc<A>, _>(|application| {
                application as Arc<dyn ApplicationView>
            });
        for plugin in A::plugins().plugins() {
            if let Some(module) = plugin.module() {
                binder.install(module.as_ref());
            }
        }
    }
}

/// Builds `A` through a fresh injector and attaches that injector to it.
pub fn application_factory<A: Application>() -> Result<Arc<A>, ApplicationError> {
    application_factory_with::<A>(&[])
}

/// Like [`application_factory`], with extra modules installed after the
/// application module so their bindings take precedence.
pub fn application_factory_with<A: Application>(
    modules: &[&dyn Module],
) -> Result<Arc<A>, ApplicationError> {
    let mut binder = Binder::new();
    binder.install(&GenericApplicationModule::<A, A::Config>::new());
    for module in modules {
        binder.install(*module);
    }
    let injector = Arc::new(Injector::from_binder(binder));
    let application = injector
        .get::<Arc<A>>()
        .map_err(into_application_error)?;
    application.base().attach_injector(injector)?;
    Ok(application)
}

/// Surfaces the construction error hidden behind nested provider failures.
fn into_application_error(e: InjectorError) -> ApplicationError {
    let (interface, source) = match e {
        InjectorError::Provider { interface, source } => (interface, source),
        e => return e.into(),
    };
    let source = match source.downcast::<ApplicationError>() {
        Ok(e) => return e,
        Err(source) => source,
    };
    let source = match source.downcast::<ConfigFactoryError>() {
        Ok(e) => return e.into(),
        Err(source) => source,
    };
    match source.downcast::<InjectorError>() {
        Ok(inner) => into_application_error(inner),
        Err(source) => InjectorError::Provider { interface, source }.into(),
    }
}
