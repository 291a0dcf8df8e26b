//! Controller runner - builds controller futures
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use wirepact_common::crd::{CertificateAuthority, MeshParticipant};

use crate::config::OperatorConfig;
use crate::controller::{ca, participant};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the CertificateAuthority controller
///
/// The CA workload lives in the operator namespace; changes to its Deployment
/// and Service trigger the owning CA.
pub fn build_ca_controllers(client: Client, config: Arc<OperatorConfig>) -> Vec<ControllerFuture> {
    let cas: Api<CertificateAuthority> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &config.namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &config.namespace);
    let ctx = Arc::new(ca::CaContext::from_client(client, config));

    tracing::info!("- CertificateAuthority controller");

    vec![Box::pin(
        Controller::new(cas, watcher())
            .owns(deployments, watcher())
            .owns(services, watcher())
            .shutdown_on_signal()
            .run(ca::reconcile, ca::error_policy, ctx)
            .for_each(log_reconcile_result("CertificateAuthority")),
    )]
}

/// Build the MeshParticipant controller
pub fn build_participant_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
) -> Vec<ControllerFuture> {
    let participants: Api<MeshParticipant> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client.clone());
    let ctx = Arc::new(participant::ParticipantContext::from_client(client, config));

    tracing::info!("- MeshParticipant controller");

    vec![Box::pin(
        Controller::new(participants, watcher())
            .owns(config_maps, watcher())
            .shutdown_on_signal()
            .run(participant::reconcile, participant::error_policy, ctx)
            .for_each(log_reconcile_result("MeshParticipant")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
