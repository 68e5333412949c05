use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt,
    layer::{Identity, Layer},
    prelude::*,
    reload,
    util::TryInitError,
    EnvFilter, Registry,
};

use crate::error::LogError;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// A layer added to the subscriber after it was installed.
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

static EXTRA_LAYER: OnceLock<reload::Handle<BoxedLayer, Registry>> = OnceLock::new();

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Human readable lines.
    #[default]
    Console,
    /// One json object per event, including the current span.
    Json,
}

/// Installs the global tracing subscriber. Fails if one is already installed.
///
/// The subscriber keeps a slot for one more layer, filled later through
/// [`install_layer`].
pub fn setup_log(mode: LogMode) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (extra, handle) = reload::Layer::new(Box::new(Identity::new()) as BoxedLayer);
    let registry = tracing_subscriber::registry().with(extra).with(filter);
    match mode {
        LogMode::Console => registry.with(fmt::layer().with_target(true)).try_init(),
        LogMode::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    }?;
    // a first successful init is the only one reaching this point
    let _ = EXTRA_LAYER.set(handle);
    Ok(())
}

/// Adds `layer` to the subscriber installed by [`setup_log`], replacing the
/// layer added before. Returns false when [`setup_log`] did not install the
/// global subscriber.
pub fn install_layer(layer: BoxedLayer) -> bool {
    match EXTRA_LAYER.get() {
        Some(handle) => handle
            .reload(layer)
            .log_context_passthrough("installing a tracing layer")
            .is_ok(),
        None => false,
    }
}
