use std::{process, sync::Arc, time::Duration};

use axum_server::{Handle, tls_rustls::RustlsConfig};
use futures::future::try_join_all;
use raffica::{
    cache::{ByteCache, ShardedStore, StoreConfig},
    config,
    error::AppError,
    http::{ProxyState, RequestPolicy, build_router},
    stats::Stats,
    telemetry,
    upstream::UpstreamFetcher,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

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
    let (_cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let store = ShardedStore::open(&StoreConfig {
        paths: settings.cache.file_paths.clone(),
        total_capacity_bytes: settings.cache.capacity_bytes.get(),
        max_items: settings.cache.max_items.get(),
    })?;
    let store: Arc<dyn ByteCache> = Arc::new(store);

    let fetcher = Arc::new(UpstreamFetcher::new(&settings.upstream)?);
    let stats = Arc::new(Stats::default());

    let state = ProxyState {
        store: store.clone(),
        fetcher,
        stats,
        policy: Arc::new(RequestPolicy::from_settings(&settings)),
    };
    let router = build_router(state);

    let handle = Handle::new();
    let mut servers = Vec::new();

    for addr in &settings.server.http_addrs {
        info!(target: "raffica::server", addr = %addr, "Listening for HTTP");
        servers.push(tokio::spawn(
            axum_server::bind(*addr)
                .handle(handle.clone())
                .serve(router.clone().into_make_service()),
        ));
    }

    if let Some(tls) = settings.server.tls.as_ref()
        && !settings.server.https_addrs.is_empty()
    {
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file).await?;
        for addr in &settings.server.https_addrs {
            info!(target: "raffica::server", addr = %addr, "Listening for HTTPS");
            servers.push(tokio::spawn(
                axum_server::bind_rustls(*addr, rustls_config.clone())
                    .handle(handle.clone())
                    .serve(router.clone().into_make_service()),
            ));
        }
    }

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install shutdown signal handler");
            return;
        }
        info!(target: "raffica::server", "Shutdown signal received");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let results = try_join_all(servers)
        .await
        .map_err(|err| AppError::telemetry(format!("server task panicked: {err}")))?;
    for result in results {
        result?;
    }

    // Flush the cache snapshot before exiting so persistent shards
    // survive the restart.
    store.close()?;
    info!(target: "raffica::server", "Shutdown complete");

    Ok(())
}
