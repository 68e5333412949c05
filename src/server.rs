use std::{future::Future, net::SocketAddr};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use crate::{error::LogError, plugin::ApplicationView};

/// Serves the application on its configured host and port until Ctrl-C.
pub async fn serve(application: &dyn ApplicationView) -> anyhow::Result<()> {
    serve_until(application, shutdown_signal()).await
}

/// Runs the startup lifespan, serves requests until `signal` resolves, then
/// runs the shutdown lifespan once. A failed startup serves nothing.
pub async fn serve_until<F>(application: &dyn ApplicationView, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = application.config();
    let settings = config.application();
    let addr = resolve(&settings.host, settings.port).await?;
    let web_app = application.web_app().clone();

    tracing::info!("Starting application `{}`.", settings.title);
    web_app
        .startup()
        .await
        .log_context_passthrough("application startup")?;

    let served = run(web_app.router(), addr, signal)
        .await
        .log_context_passthrough("http server");
    tracing::info!("Shutting down application `{}`.", settings.title);
    let shutdown = web_app
        .shutdown()
        .await
        .log_context_passthrough("application shutdown");
    served.and(shutdown)
}

async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}

async fn run<F>(router: Router, addr: SocketAddr, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.log().is_none() {
        std::future::pending::<()>().await;
    }
}
