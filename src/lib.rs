//! App Factory is a scaffolding library for http services: a YAML
//! configuration loader with environment interpolation, a runtime
//! dependency injector, a plugin system with lifecycle hooks, and a base
//! application tying them to an http application.
//!
//! An application names the package holding its `application.yaml`:
//!
//! ```yaml
//! application:
//!   title: Books
//!   environment: ${ENVIRONMENT:development}
//!   port: ${PORT:8000}
//! plugins:
//!   activate:
//!     - telemetry
//! telemetry:
//!   excluded_urls:
//!     - /api/v1/sys
//! ```
//!
//! The application type itself only wraps a [`BaseApplication`](application::BaseApplication).
//! [`application_factory`](module::application_factory) reads the
//! configuration, builds the application through the injector, and loads the
//! activated plugins. Serving runs the plugins' startup hooks before accepting
//! requests and their shutdown hooks after the last one.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use app_factory::{
//!     application::{Application, ApplicationConfig, BaseApplication},
//!     configs::Package,
//!     error::ApplicationError,
//!     logging::{setup_log, LogMode},
//!     module::application_factory,
//!     server,
//! };
//!
//! pub struct Books {
//!     base: BaseApplication,
//! }
//!
//! impl Application for Books {
//!     type Config = ApplicationConfig;
//!
//!     fn package_resource() -> Package {
//!         Package::new("books")
//!     }
//!
//!     fn new(config: Arc<ApplicationConfig>) -> Result<Self, ApplicationError> {
//!         Ok(Self {
//!             base: BaseApplication::new::<Self>(config)?,
//!         })
//!     }
//!
//!     fn base(&self) -> &BaseApplication {
//!         &self.base
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     setup_log(LogMode::Console)?;
//!     let books = application_factory::<Books>()?;
//!     server::serve(&*books).await
//! }
//! ```
//!
//! Routes are plain `axum` routers. Handlers resolve their dependencies from
//! the injector attached to the http application:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use app_factory::{
//!     inject,
//!     web::{HandlerResult, Injected},
//! };
//! use axum::{routing::get, Json, Router};
//!
//! pub trait Catalog: Send + Sync {
//!     fn titles(&self) -> anyhow::Result<Vec<String>>;
//! }
//!
//! inject!(
//!     pub struct BookService {
//!         catalog: Arc<dyn Catalog>,
//!     }
//! );
//!
//! impl BookService {
//!     pub fn titles(&self) -> anyhow::Result<Vec<String>> {
//!         self.catalog.titles()
//!     }
//! }
//!
//! // bound with `binder.bind_injected::<BookService>()`
//! async fn list_books(
//!     Injected(books): Injected<Arc<BookService>>,
//! ) -> HandlerResult<Json<Vec<String>>> {
//!     Ok(Json(books.titles()?))
//! }
//!
//! pub fn router() -> Router {
//!     Router::new().route("/api/v1/books", get(list_books))
//! }
//! ```

/// The base application and its configuration model.
pub mod application;
/// Typed configuration built from package resources.
pub mod configs;
/// Runtime dependency injection keyed by type.
pub mod dependency_injection;
/// Error types shared across the crate and logging helpers for errors.
pub mod error;
/// System health route mounted on every application.
pub mod health_endpoint;
/// Global tracing subscriber setup.
pub mod logging;
/// Injector bindings for a concrete application and its configuration.
pub mod module;
/// The plugin protocol and the registry of available plugins.
pub mod plugin;
/// Activation and lifecycle sequencing of plugins.
pub mod plugin_manager;
/// Plugins shipped with the crate.
pub mod plugins;
/// Serves an application over http.
pub mod server;
/// The http application: routes, layers, the attached injector and lifespan.
pub mod web;
/// YAML reading with environment variable interpolation.
pub mod yaml_reader;

/// misc items that are too small to get their own files,
/// kept out of this file to reduce clutter.
mod util;
pub use util::*;
