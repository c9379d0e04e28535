use std::sync::Arc;

use anyhow::Context;

use courier_api::app::{build_app, build_services, AuthConfig};
use courier_infra::config::Settings;
use courier_infra::workers::{WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    tracing::info!(?settings, "starting email service");

    let services = Arc::new(build_services(&settings).await?);

    let pool = WorkerPool::spawn(
        services.worker.clone(),
        WorkerPoolConfig::default().with_concurrency(settings.worker_concurrency),
    );
    let scheduler = services.scheduler.start();

    let app = build_app(
        services,
        AuthConfig {
            jwt_secret: settings.auth_secret_key.clone(),
            secret_key: settings.secret_key.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{}", settings.port))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("shutting down background tasks");
    pool.shutdown().await;
    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
