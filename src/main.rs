use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cache::ImageCache;
use crate::cluster::client::KubeStore;
use crate::cluster::{ObjectStore, WATCHED_KINDS};
use crate::config::Config;
use crate::context::Context;
use crate::controller::Controller;
use crate::keychain::{ClusterKeychain, KeychainResolver, docker_config_path};
use crate::metrics::Collector;
use crate::reconciler::Reconciler;
use crate::registry::RegistryClient;
use crate::registry::auth::Keychain;
use crate::registry::oci::OciClient;
use crate::resolver::ImageResolver;

mod cache;
mod cli;
mod cluster;
mod config;
mod context;
mod controller;
mod extract;
mod keychain;
mod metrics;
mod platform;
mod reconciler;
mod reference;
mod registry;
mod resolver;
mod server;

fn main() -> Result<(), Box<dyn Error>> {
    // Needs to be initialised so that the registry and cluster clients can use
    // rustls and not be dependent on openssl. This makes building for musl a
    // lot easier.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;
    let cli = cli::Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    let custom_format = fmt::format()
        .with_target(false)
        .with_file(true)
        .with_level(true)
        .with_line_number(true)
        .compact();
    let fmt_layer = fmt::layer().event_format(custom_format);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    let config = Config::from_cli(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    info!(
        cache_duration = ?config.exporter.cache_duration,
        platform = ?config.exporter.platform.as_ref().map(ToString::to_string),
        insecure_registries = ?config.registry.insecure_registries,
        "Starting container image exporter"
    );

    // In-cluster service account, falling back to the local kubeconfig.
    let client = kube::Client::try_default().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let registry: Arc<dyn RegistryClient> = Arc::new(OciClient::new(config.registry.timeout, &config.registry.insecure_registries));
    // Shared by every reconciler and the collector.
    let cache = Arc::new(ImageCache::new());
    let resolver = Arc::new(ImageResolver::new(registry, Some(Arc::clone(&cache))));
    let keychains: Arc<dyn KeychainResolver> = Arc::new(ClusterKeychain::new(Arc::clone(&store), default_keychain()));
    let exporter = Arc::new(config.exporter);

    let ctx = Context::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Bind before starting any controller so a taken port fails the start.
    if let Some(address) = config.server.metrics_address {
        let listener = server::bind("metrics", address).await?;
        let collector = Arc::new(Collector::new(Arc::clone(&store), Arc::clone(&cache), &WATCHED_KINDS));
        let router = server::metrics_router(collector);
        let shutdown = ctx.token().clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, router, shutdown).await {
                error!("Metrics server failed: {e}");
            }
        }));
    }
    if let Some(address) = config.server.probe_address {
        let listener = server::bind("health probes", address).await?;
        let shutdown = ctx.token().clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, server::probe_router(), shutdown).await {
                error!("Health probe server failed: {e}");
            }
        }));
    }

    for kind in &WATCHED_KINDS {
        let reconciler = Reconciler::new(
            kind,
            Arc::clone(&store),
            Arc::clone(&keychains),
            Arc::clone(&resolver),
            Arc::clone(&exporter),
        );
        let controller = Controller::new(Arc::new(reconciler), client.clone(), config.controller.clone());
        tasks.push(tokio::spawn(controller.run(ctx.clone())));
    }

    shutdown_signal().await?;
    info!("Shutting down");
    // Stops the servers and controllers and aborts in-flight registry calls.
    ctx.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {e}");
        }
    }
    match cache.len() {
        Ok(digests) => info!("Stopped with {digests} cached image digest(s)"),
        Err(e) => error!("{e}"),
    }
    Ok(())
}

/// Credentials of the exporter itself, used for registries that no pull
/// secret covers.
fn default_keychain() -> Keychain {
    let Some(path) = docker_config_path() else {
        return Keychain::anonymous();
    };
    match Keychain::from_docker_config_file(&path) {
        Ok(keychain) => {
            if !keychain.is_empty() {
                info!("Using registry credentials from {}", path.display());
            }
            keychain
        }
        Err(e) => {
            warn!("Ignoring {}: {e}", path.display());
            Keychain::anonymous()
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
