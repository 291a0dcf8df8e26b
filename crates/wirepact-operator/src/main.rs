//! WirePact Operator - enrolls Kubernetes workloads in the authentication mesh

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use wirepact_common::telemetry::init_telemetry;
use wirepact_operator::config::{Cli, OperatorConfig};
use wirepact_operator::controller_runner::{build_ca_controllers, build_participant_controllers};
use wirepact_operator::startup::{
    crd_manifests, ensure_crds_installed, start_ca_seeding, start_catalog_seeding, SeedClientImpl,
};
use wirepact_operator::webhook::{self, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook server and the kube client both rely on a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(cli.log_format)?;

    run_operator(cli).await
}

async fn run_operator(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("WirePact operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = Arc::new(OperatorConfig::from_cli(&cli, client.default_namespace()));
    tracing::info!(
        namespace = %config.namespace,
        ca = %config.ca_name,
        envoy_image = %config.envoy_image,
        "operator configuration"
    );

    ensure_crds_installed(&client).await?;

    let seeds = Arc::new(SeedClientImpl::new(client.clone()));
    start_ca_seeding(seeds.clone(), config.ca_name.clone());
    start_catalog_seeding(seeds);

    match config.webhook_tls.clone() {
        Some(tls) => {
            let state = Arc::new(WebhookState::from_client(client.clone()));
            let port = config.webhook_port;
            tokio::spawn(async move {
                if let Err(e) = webhook::serve(port, &tls, state).await {
                    tracing::error!(error = %e, "admission webhook server failed");
                }
            });
        }
        None => tracing::warn!("no webhook TLS material configured, admission webhook disabled"),
    }

    tracing::info!("Starting controllers:");
    let mut controllers = build_ca_controllers(client.clone(), config.clone());
    controllers.extend(build_participant_controllers(client, config));

    futures::future::join_all(controllers).await;

    tracing::info!("WirePact operator shutting down");
    Ok(())
}
