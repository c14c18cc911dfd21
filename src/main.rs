use std::{process, sync::Arc};

use regcache::{
    application::{
        error::AppError,
        proxy::RegistryProxy,
        repos::{BlobStore, KeyValueStore},
        search::PrimeOutcome,
    },
    config::{self, Settings, StoreBackend},
    domain::metadata::TarballRewriter,
    infra::{
        blobs::FsBlobStore,
        error::InfraError,
        http::{RegistryState, build_router},
        kv::{MemoryStore, RedisStore},
        telemetry,
        upstream::ReqwestUpstream,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Prime(_) => run_prime(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let proxy = Arc::new(build_proxy(&settings).await?);
    prime(&proxy).await?;

    let router = build_router(RegistryState::new(proxy.clone()));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "regcache::serve",
        addr = %settings.server.addr,
        public = %settings.registries.public_prefix(),
        private = %settings.registries.private_prefix(),
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    let pending = proxy.write_behind().pending();
    if pending > 0 {
        info!(
            target = "regcache::serve",
            pending, "waiting for cache writes to finish"
        );
    }
    if !proxy
        .write_behind()
        .drain_within(settings.server.graceful_shutdown)
        .await
    {
        warn!(
            target = "regcache::serve",
            "shutdown timeout elapsed with cache writes outstanding"
        );
    }

    Ok(())
}

async fn run_prime(settings: Settings) -> Result<(), AppError> {
    let proxy = build_proxy(&settings).await?;
    prime(&proxy).await
}

async fn prime(proxy: &RegistryProxy) -> Result<(), AppError> {
    match proxy.search().prime().await? {
        PrimeOutcome::AlreadyPrimed => {}
        PrimeOutcome::Primed => {
            info!(target = "regcache::prime", "search index primed");
        }
    }
    Ok(())
}

async fn build_proxy(settings: &Settings) -> Result<RegistryProxy, AppError> {
    let store: Arc<dyn KeyValueStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&settings.store.redis_url)
                .await
                .map_err(|err| AppError::from(InfraError::store(err.to_string())))?,
        ),
    };

    let fs_blobs = FsBlobStore::new(settings.storage.directory.clone())
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "regcache::serve",
        directory = %fs_blobs.root().display(),
        "tarball storage ready"
    );
    let blobs: Arc<dyn BlobStore> = Arc::new(fs_blobs);

    let upstream = ReqwestUpstream::new(
        &settings.registries.public_prefix(),
        settings.upstream.timeout,
        settings.upstream.connect_timeout,
    )?;

    let rewriter = TarballRewriter::new(
        settings.registries.public_prefix(),
        settings.registries.private_prefix(),
    );

    Ok(RegistryProxy::new(
        Arc::new(upstream),
        store,
        blobs,
        rewriter,
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "regcache::serve", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "regcache::serve", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(target = "regcache::serve", "shutdown signal received");
}
