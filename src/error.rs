use crate::{
    dependency_injection::InjectorError, module::ConfigFactoryError,
    plugin_manager::PluginManagerError,
};

/// Failures while constructing an application or bringing it to a startable
/// state.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("the package name must be set in the concrete application")]
    PackageNameUnset,
    #[error(transparent)]
    ConfigFactory(#[from] ConfigFactoryError),
    #[error(transparent)]
    PluginManager(#[from] PluginManagerError),
    #[error(transparent)]
    Injector(#[from] InjectorError),
    #[error("an injector is already attached to the application")]
    InjectorAlreadyAttached,
}

/// Enables logging of errors on their way up the stack.
pub trait LogError<T>: Sized {
    /// Logs if there was an error and converts the result into an option
    fn log(self) -> Option<T>;

    /// Logs if there was an error and returns the result unchanged
    fn log_passthrough(self) -> Self;

    /// Logs if there was an error with a message and returns the result unchanged
    fn log_context_passthrough(self, ctx: &str) -> Self {
        self.log_with_context_passthrough(|| ctx.into())
    }

    /// Lazily logs if there was an error with a message and returns the result unchanged
    fn log_with_context_passthrough<Ctx: Fn() -> String>(self, ctx: Ctx) -> Self;
}

impl<T, E: std::fmt::Display + 'static> LogError<T> for Result<T, E> {
    fn log(self) -> Option<T> {
        self.log_passthrough().ok()
    }

    fn log_passthrough(self) -> Self {
        self.map_err(|e| {
            tracing::error!("{}", display_error(&e));
            e
        })
    }

    fn log_with_context_passthrough<Ctx: Fn() -> String>(self, ctx: Ctx) -> Self {
        self.map_err(|e| {
            let ctx = ctx();
            let es = display_error(&e);
            tracing::error!("error: `{ctx}` - {es}");
            e
        })
    }
}

/// use this to make sure you have a descriptive message including the cause
/// chain for anyhow errors, and otherwise just display the normal string for
/// other errors.
pub fn display_error<E: std::fmt::Display + 'static>(e: &E) -> String {
    match (e as &dyn std::any::Any).downcast_ref::<anyhow::Error>() {
        Some(e) => format!("{e:#}"),
        None => format!("{e}"),
    }
}
