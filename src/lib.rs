use std::sync::Arc;

use actix_web::{
    dev::ServerHandle,
    middleware::{NormalizePath, TrailingSlash},
    web::Data,
    App, HttpServer,
};
use config::Config;
use service::Service;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod bus;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod message;
pub mod notifier;
pub mod policy;
pub mod poller;
pub mod queue;
pub mod service;
pub mod task;
pub mod utils;

/// Seconds in-flight requests get to finish once shutdown starts.
const SHUTDOWN_TIMEOUT: u64 = 5;

/// Installs the global subscriber, filtered by `RELAYMQ_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("RELAYMQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

/// Returns a builder for the HTTP server.
///
/// The server stops on SIGINT or SIGTERM. Pending long polls are cancelled first, then
/// in-flight requests get [`SHUTDOWN_TIMEOUT`] seconds to drain.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Config) -> eyre::Result<()> {
    let shutdown = CancellationToken::new();
    let listen_addr = config.listen_addr.clone();
    let sweep_interval = config.sweep_interval();

    let service = Arc::new(
        Service::connect_with()
            .config(config)
            .shutdown(shutdown.clone())
            .call()
            .await?,
    );

    let bus = tokio::spawn({
        let bus = service.bus().clone();
        let cancel = shutdown.clone();
        async move { bus.run(cancel).await }
    });

    let sweeper = sweep_interval.map(|interval| {
        tracing::info!(?interval, "Starting sweeper");
        service.clone().spawn_sweeper(interval, shutdown.clone())
    });

    let data = Data::from(service);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .app_data(data.clone())
            .configure(api::configure)
    })
    .bind(&listen_addr)?
    .shutdown_timeout(SHUTDOWN_TIMEOUT)
    .disable_signals()
    .run();

    tracing::info!(%listen_addr, "Listening");

    tokio::spawn(stop_on_signal(server.handle(), shutdown.clone()));

    server.await?;

    shutdown.cancel();

    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }

    bus.await??;

    Ok(())
}

async fn stop_on_signal(server: ServerHandle, shutdown: CancellationToken) {
    wait_for_signal().await;

    tracing::info!("Shutting down");

    shutdown.cancel();
    server.stop(true).await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            tracing::warn!(%error, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
