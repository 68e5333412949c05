use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Path,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};

use app_factory::{
    application::{AppConfig, Application, ApplicationConfig, BaseApplication, Environment},
    configs::Package,
    error::ApplicationError,
    module::{application_factory, ConfigFactoryError},
    plugin::{ApplicationView, Plugin, PluginRegistry},
    plugin_manager::PluginManagerError,
    plugins::{
        odm::{OdmClient, OdmDatabase, OdmError},
        telemetry::Telemetry,
    },
    server,
    web::{HandlerResult, Injected},
};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

type Log = Mutex<Vec<String>>;

static RECORDED: Log = const_mutex(vec![]);
static FAULTY: Log = const_mutex(vec![]);

struct Recorder {
    log: &'static Log,
}

impl Recorder {
    fn record(&self, event: &str) {
        self.log.lock().push(event.to_string());
    }
}

#[async_trait]
impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_load(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        self.record("load");
        Ok(())
    }

    async fn on_startup(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        self.record("startup");
        Ok(())
    }

    async fn on_shutdown(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        self.record("shutdown");
        Ok(())
    }
}

struct Guard;

impl Plugin for Guard {
    fn name(&self) -> &str {
        "guard"
    }

    fn pre_conditions_check(&self, application: &dyn ApplicationView) -> bool {
        application.config().application().environment != Environment::Production
    }
}

struct Faulty;

#[async_trait]
impl Plugin for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn on_startup(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        anyhow::bail!("upstream unavailable")
    }
}

/// Declares an application over the fixture package of the same name.
macro_rules! fixture_application {
    ($Name:ident, $package:literal, $registry:expr) => {
        struct $Name {
            base: BaseApplication,
        }

        impl Application for $Name {
            type Config = ApplicationConfig;

            fn package_resource() -> Package {
                Package::new($package).with_root(FIXTURES)
            }

            fn plugins() -> PluginRegistry {
                $registry
            }

            fn new(config: Arc<ApplicationConfig>) -> Result<Self, ApplicationError> {
                Ok(Self {
                    base: BaseApplication::new::<Self>(config)?,
                })
            }

            fn base(&self) -> &BaseApplication {
                &self.base
            }
        }
    };
}

fixture_application!(Library, "library", PluginRegistry::with_builtins());
fixture_application!(Observed, "observed", PluginRegistry::with_builtins());
fixture_application!(
    Guarded,
    "guarded",
    PluginRegistry::new()
        .with(Arc::new(Recorder { log: &RECORDED }))
        .with(Arc::new(Guard))
);
fixture_application!(
    Recorded,
    "recorded",
    PluginRegistry::new().with(Arc::new(Recorder { log: &RECORDED }))
);
fixture_application!(
    Unstartable,
    "faulty",
    PluginRegistry::new()
        .with(Arc::new(Recorder { log: &FAULTY }))
        .with(Arc::new(Faulty))
);
fixture_application!(Broken, "broken", PluginRegistry::new());
fixture_application!(Missing, "missing", PluginRegistry::new());

#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct Book {
    title: String,
}

async fn get_book(
    Path(id): Path<String>,
    Injected(database): Injected<OdmDatabase>,
) -> HandlerResult {
    Ok(match database.collection::<Book>("books").find(&id)? {
        Some(book) => Json(book).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn put_book(
    Path(id): Path<String>,
    Injected(database): Injected<OdmDatabase>,
    Json(book): Json<Book>,
) -> HandlerResult<StatusCode> {
    let books = database.collection::<Book>("books");
    match books.replace(&id, &book) {
        Err(OdmError::NotFound { .. }) => {
            books.insert(&id, &book)?;
            Ok(StatusCode::CREATED)
        }
        replaced => {
            replaced?;
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

/// Books stored through the odm plugin, served under `/catalog`.
struct Catalog {
    base: BaseApplication,
}

impl Application for Catalog {
    type Config = ApplicationConfig;

    fn package_resource() -> Package {
        Package::new("catalog").with_root(FIXTURES)
    }

    fn new(config: Arc<ApplicationConfig>) -> Result<Self, ApplicationError> {
        let base = BaseApplication::new::<Self>(config)?;
        base.web_app()
            .include_router(Router::new().route("/books/{id}", get(get_book).put(put_book)));
        Ok(Self { base })
    }

    fn base(&self) -> &BaseApplication {
        &self.base
    }
}

fn get_request(path: &str) -> Request<Body> {
    Request::get(path).body(Body::empty()).unwrap()
}

fn put_json(path: &str, body: &str) -> Request<Body> {
    Request::put(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn minimal_application_answers_health_probe() {
    let library = application_factory::<Library>().unwrap();
    let config = library.config();
    assert_eq!(config.application().title, "Library");
    assert_eq!(config.application().description, "Books on loan");
    assert_eq!(config.application().environment, Environment::Development);
    assert_eq!(config.application().port, 0);
    assert!(library.base().plugin_manager().plugins().is_empty());

    let response = library.web_app().handle(get_request("/api/v1/sys/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, br#"{"status":"OK"}"#);
}

#[test]
fn factory_shares_application_and_config_singletons() {
    let library = application_factory::<Library>().unwrap();
    let injector = library.injector().unwrap();

    let concrete = injector.get::<Arc<Library>>().unwrap();
    assert!(Arc::ptr_eq(&library, &concrete));
    let view = injector.get::<Arc<dyn ApplicationView>>().unwrap();
    assert!(std::ptr::eq(
        Arc::as_ptr(&library) as *const u8,
        Arc::as_ptr(&view) as *const u8
    ));

    let config = injector.get::<Arc<ApplicationConfig>>().unwrap();
    let abstracted = injector.get::<Arc<dyn AppConfig>>().unwrap();
    assert!(std::ptr::eq(
        Arc::as_ptr(&config) as *const u8,
        Arc::as_ptr(&abstracted) as *const u8
    ));
    assert!(std::ptr::eq(
        Arc::as_ptr(&config) as *const u8,
        Arc::as_ptr(&library.config()) as *const u8
    ));
}

#[test]
fn failed_pre_condition_prevents_construction() {
    let err = application_factory::<Guarded>().err().unwrap();
    assert!(matches!(
        err,
        ApplicationError::PluginManager(PluginManagerError::PreConditionsNotMet { ref plugin })
            if plugin == "guard"
    ));
}

#[test]
fn invalid_and_missing_configuration_are_distinguished() {
    assert!(matches!(
        application_factory::<Broken>().err().unwrap(),
        ApplicationError::ConfigFactory(ConfigFactoryError::ValueErrorConfig(_))
    ));
    assert!(matches!(
        application_factory::<Missing>().err().unwrap(),
        ApplicationError::ConfigFactory(ConfigFactoryError::UnableToReadConfigFile(_))
    ));
}

#[tokio::test]
async fn serving_brackets_requests_with_plugin_hooks() {
    let recorded = application_factory::<Recorded>().unwrap();
    server::serve_until(&*recorded, async {}).await.unwrap();
    assert_eq!(
        *RECORDED.lock(),
        vec!["load", "startup", "shutdown"]
    );
}

#[tokio::test]
async fn startup_failure_stops_before_serving() {
    let unstartable = application_factory::<Unstartable>().unwrap();
    let err = server::serve_until(&*unstartable, async {})
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("upstream unavailable"));
    assert_eq!(*FAULTY.lock(), vec!["load"]);
}

#[tokio::test]
async fn telemetry_instruments_requests_and_flushes_on_shutdown() {
    let observed = application_factory::<Observed>().unwrap();
    let web_app = observed.web_app();
    assert!(observed
        .injector()
        .unwrap()
        .get::<Arc<Telemetry>>()
        .is_ok());

    web_app.startup().await.unwrap();
    assert_eq!(
        web_app.handle(get_request("/api/v1/sys/health")).await.status(),
        StatusCode::OK
    );
    for i in 0..100 {
        let response = web_app.handle(get_request(&format!("/scan/{i}"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    web_app.shutdown().await.unwrap();
}

#[tokio::test]
async fn odm_store_is_open_while_serving() {
    let catalog = application_factory::<Catalog>().unwrap();
    let web_app = catalog.web_app();
    assert_eq!(
        web_app.handle(get_request("/catalog/books/b1")).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );

    web_app.startup().await.unwrap();
    let created = web_app
        .handle(put_json("/catalog/books/b1", r#"{"title":"Emma"}"#))
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let replaced = web_app
        .handle(put_json("/books/b1", r#"{"title":"Persuasion"}"#))
        .await;
    assert_eq!(replaced.status(), StatusCode::NO_CONTENT);

    let found = web_app.handle(get_request("/catalog/books/b1")).await;
    assert_eq!(found.status(), StatusCode::OK);
    assert_eq!(body_bytes(found).await, br#"{"title":"Persuasion"}"#);
    assert_eq!(
        web_app.handle(get_request("/catalog/books/b2")).await.status(),
        StatusCode::NOT_FOUND
    );

    web_app.shutdown().await.unwrap();
    let injector = catalog.injector().unwrap();
    assert!(!injector.get::<Arc<OdmClient>>().unwrap().is_connected());
    assert!(injector.get::<OdmDatabase>().is_err());
}
