use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use plugin_pilot::api::{self, App};
use plugin_pilot::config::Settings;
use plugin_pilot::infrastructure::artifact_store::ArtifactStore;
use plugin_pilot::infrastructure::container::ContainerEngine;
use plugin_pilot::infrastructure::notifier::Notifier;
use plugin_pilot::infrastructure::registry::RegistryClient;
use plugin_pilot::infrastructure::scanner::ScanRunner;
use plugin_pilot::infrastructure::signer::Signer;
use plugin_pilot::orchestrator::pipelines::MlPipelineClient;
use plugin_pilot::orchestrator::Reconciler;
use plugin_pilot::pipeline::{Deps, PipelineController};
use plugin_pilot::store::Stores;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "plugin_pilot=info,kube=warn".to_string()),
        )
        .with_target(false)
        .init();

    let args = cli::Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(host) = args.host {
        settings.service.host = host;
    }
    if let Some(port) = args.port {
        settings.service.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        settings.service.data_dir = data_dir;
    }
    if let Some(work_root) = args.work_root {
        settings.service.work_root = work_root;
    }
    settings.validate().context("Configuration invalid")?;

    for dir in [
        &settings.service.work_root,
        &settings.service.bundle_dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let stores = Stores::open(&settings.service.data_dir)?;

    let kube_config = kube::Config::infer()
        .await
        .context("Failed to infer kubeconfig")?;
    let kube_client =
        kube::Client::try_from(kube_config).context("Failed to create Kubernetes client")?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let deps = Arc::new(Deps {
        engine: ContainerEngine::new(settings.registry.clone()),
        registry: RegistryClient::new(&settings.registry),
        signer: Signer::new(settings.signing.clone(), settings.registry.clone()),
        scanner: ScanRunner::new(settings.scan.clone(), http.clone()),
        artifacts: ArtifactStore::new(&settings.artifact_store)?,
        notifier: Notifier::new(&settings.notifier, http.clone()),
        reconciler: Reconciler::new(kube_client, settings.orchestrator.clone()),
        ml_pipelines: MlPipelineClient::new(settings.ml_pipelines.clone(), http.clone()),
        stores,
        http,
        settings,
    });

    let controller = Arc::new(PipelineController::new(Arc::clone(&deps)));
    let app = Arc::new(App::new(controller));

    let addr = format!(
        "{}:{}",
        deps.settings.service.host, deps.settings.service.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr, "plugin-pilot listening");

    axum::serve(listener, api::router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
    }
}
