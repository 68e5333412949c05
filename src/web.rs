use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Extension, Router,
};
use parking_lot::{Mutex, RwLock};
use tower::ServiceExt;

use crate::{dependency_injection::Injector, error::display_error};

pub type HandlerResult<T = Response> = Result<T, HandlerError>;

type RouterLayer = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Descriptive attributes of the http application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebAppMetadata {
    pub title: String,
    pub description: String,
    pub version: String,
    /// Prefix under which every route is also served, for deployments behind
    /// a proxy.
    pub root_path: String,
    /// Expose handler error details in 500 responses.
    pub debug: bool,
}

/// A failed request handler, answered with a 500.
#[derive(Debug)]
pub struct HandlerError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for HandlerError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[derive(Clone, Debug)]
struct ErrorDetail(String);

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let detail = display_error(&self.0);
        tracing::error!("Request handler failed: {detail}");
        let mut response =
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        response.extensions_mut().insert(ErrorDetail(detail));
        response
    }
}

async fn expose_error_detail(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    match response.extensions().get::<ErrorDetail>() {
        Some(ErrorDetail(detail)) => (response.status(), detail.clone()).into_response(),
        None => response,
    }
}

/// Extracts a dependency from the injector attached to the application.
///
/// ```ignore
/// async fn list_books(Injected(catalog): Injected<Arc<dyn Catalog>>) -> Json<Vec<String>> {
///     Json(catalog.titles())
/// }
/// ```
pub struct Injected<T>(pub T);

impl<S, T> FromRequestParts<S> for Injected<T>
where
    S: Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    type Rejection = HandlerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let injector = parts
            .extensions
            .get::<Arc<Injector>>()
            .ok_or_else(|| anyhow!("no injector is attached to the application"))?;
        Ok(Self(injector.get()?))
    }
}

/// Brackets the period during which the application serves requests.
#[async_trait]
pub trait Lifespan: Send + Sync {
    async fn startup(&self) -> anyhow::Result<()>;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// The http application: routes, layers, the attached injector and the
/// lifespan.
///
/// Everything is registered through `&self` so routers and plugins can extend
/// the application after it was constructed. [`WebApp::router`] assembles the
/// `axum` router that is actually served.
pub struct WebApp {
    metadata: WebAppMetadata,
    routes: Mutex<Router>,
    layers: RwLock<Vec<RouterLayer>>,
    injector: RwLock<Option<Arc<Injector>>>,
    lifespan: RwLock<Option<Arc<dyn Lifespan>>>,
}

impl WebApp {
    pub fn new(metadata: WebAppMetadata) -> Self {
        Self {
            metadata,
            routes: Mutex::new(Router::new()),
            layers: RwLock::new(vec![]),
            injector: RwLock::new(None),
            lifespan: RwLock::new(None),
        }
    }

    pub fn metadata(&self) -> &WebAppMetadata {
        &self.metadata
    }

    /// Merges the routes of `router`. Panics on overlapping routes, like
    /// [`Router::merge`].
    pub fn include_router(&self, router: Router) {
        let mut routes = self.routes.lock();
        *routes = std::mem::take(&mut *routes).merge(router);
    }

    /// Wraps every route, including the fallback. The first layer added is
    /// the outermost one.
    pub fn add_layer<F>(&self, layer: F)
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.layers.write().push(Arc::new(layer));
    }

    pub fn set_injector(&self, injector: Arc<Injector>) {
        *self.injector.write() = Some(injector);
    }

    pub fn injector(&self) -> Option<Arc<Injector>> {
        self.injector.read().clone()
    }

    pub fn set_lifespan(&self, lifespan: Arc<dyn Lifespan>) {
        *self.lifespan.write() = Some(lifespan);
    }

    pub async fn startup(&self) -> anyhow::Result<()> {
        let lifespan = self.lifespan.read().clone();
        match lifespan {
            Some(lifespan) => lifespan.startup().await,
            None => Ok(()),
        }
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let lifespan = self.lifespan.read().clone();
        match lifespan {
            Some(lifespan) => lifespan.shutdown().await,
            None => Ok(()),
        }
    }

    /// The router to serve: every route, also under the root path when one is
    /// set, wrapped in the registered layers.
    pub fn router(&self) -> Router {
        let routes = self.routes.lock().clone();
        let mut router = match normalize_root_path(&self.metadata.root_path) {
            Some(root_path) => Router::new().nest(&root_path, routes.clone()).merge(routes),
            None => routes,
        };
        for layer in self.layers.read().iter().rev() {
            router = layer(router);
        }
        if self.metadata.debug {
            router = router.layer(middleware::from_fn(expose_error_detail));
        }
        if let Some(injector) = self.injector() {
            router = router.layer(Extension(injector));
        }
        router
    }

    /// Answers a single request without a listener.
    pub async fn handle(&self, request: Request) -> Response {
        match self.router().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// `None` when the root path is empty or `/`.
fn normalize_root_path(root_path: &str) -> Option<String> {
    let trimmed = root_path.trim_matches('/');
    (!trimmed.is_empty()).then(|| format!("/{trimmed}"))
}

/// `path` with the root path removed, when it starts with it.
pub fn strip_root_path<'a>(root_path: &str, path: &'a str) -> &'a str {
    let root_path = match normalize_root_path(root_path) {
        Some(root_path) => root_path,
        None => return path,
    };
    match path.strip_prefix(root_path.as_str()) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}
