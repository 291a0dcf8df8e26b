//! CertificateAuthority controller
//!
//! Provisions the CA workload in fixed order: ServiceAccount, Role,
//! RoleBinding, Secret, Deployment, Service. Each step only creates what is
//! missing. The first failing step aborts the rest. A failing Service step also
//! clears the status address until a pass succeeds again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret,
    Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use wirepact_common::crd::{CertificateAuthority, CertificateAuthorityStatus};
use wirepact_common::events::{EventPublisher, KubeEventPublisher};
use wirepact_common::kube_utils;
use wirepact_common::{
    Error, COMPONENT_PKI, LABEL_COMPONENT, LABEL_CREATED_BY, LABEL_MANAGED_BY, LABEL_NAME,
    LABEL_PART_OF, OPERATOR_NAME, PART_OF_WIREPACT,
};

use crate::config::OperatorConfig;
use crate::convergence::{ensure_exists, ChildKind, ChildResource, ChildStore, ChildStoreImpl};

const FIELD_MANAGER: &str = "wirepact-ca-controller";

/// Name of the port on the CA container and service
pub const GRPC_PORT_NAME: &str = "grpc";

/// Trait abstracting status writes for CertificateAuthority
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaKubeClient: Send + Sync {
    /// Merge-patch the status of a CertificateAuthority
    async fn patch_status(&self, name: &str, status: &CertificateAuthorityStatus)
        -> Result<(), Error>;
}

/// Production [`CaKubeClient`]
pub struct CaKubeClientImpl {
    client: Client,
}

impl CaKubeClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CaKubeClient for CaKubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        status: &CertificateAuthorityStatus,
    ) -> Result<(), Error> {
        let api: Api<CertificateAuthority> = Api::all(self.client.clone());
        kube_utils::patch_status(&api, name, status, FIELD_MANAGER).await?;
        Ok(())
    }
}

/// Shared context for the CertificateAuthority controller
pub struct CaContext {
    /// Status writes
    pub kube: Arc<dyn CaKubeClient>,
    /// Child object access
    pub children: Arc<dyn ChildStore>,
    /// Event publishing
    pub events: Arc<dyn EventPublisher>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

impl CaContext {
    /// Create a context backed by the given client
    pub fn from_client(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self {
            kube: Arc::new(CaKubeClientImpl::new(client.clone())),
            children: Arc::new(ChildStoreImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, OPERATOR_NAME)),
            config,
        }
    }

    /// Create a context from explicit parts, for tests
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn CaKubeClient>,
        children: Arc<dyn ChildStore>,
        events: Arc<dyn EventPublisher>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            kube,
            children,
            events,
            config,
        }
    }
}

type Builder = fn(&CertificateAuthority, &str) -> ChildResource;

/// Convergence order and the builder for each child kind
const STEPS: [(ChildKind, Builder); 6] = [
    (ChildKind::ServiceAccount, build_service_account),
    (ChildKind::Role, build_role),
    (ChildKind::RoleBinding, build_role_binding),
    (ChildKind::Secret, build_secret),
    (ChildKind::Deployment, build_deployment),
    (ChildKind::Service, build_service),
];

/// Name of a child; everything but the secret is named after the CA
fn child_name(ca: &CertificateAuthority, kind: ChildKind) -> String {
    match kind {
        ChildKind::Secret => ca.spec.secret_name.clone(),
        _ => ca.name_any(),
    }
}

/// Reconcile a CertificateAuthority
#[instrument(skip(ca, ctx), fields(ca = %ca.name_any()))]
pub async fn reconcile(ca: Arc<CertificateAuthority>, ctx: Arc<CaContext>) -> Result<Action, Error> {
    let name = ca.name_any();
    let current = ca.status.clone().unwrap_or_default();

    let namespace = current
        .namespace()
        .map(str::to_string)
        .unwrap_or_else(|| ctx.config.namespace.clone());

    let dns_address = match converge(&ca, &namespace, &ctx).await {
        Ok(()) => CertificateAuthority::service_address(&name, &namespace, ca.spec.port),
        Err((ChildKind::Service, e)) => {
            // An empty address marks the CA as unready for participants
            let cleared = update_status(&ctx, &name, &current, namespace, String::new()).await;
            if let Err(patch_err) = cleared {
                warn!(error = %patch_err, "failed to clear certificate authority address");
            }
            return Err(e);
        }
        Err((kind, e)) => {
            debug!(?kind, "convergence aborted before the service step");
            return Err(e);
        }
    };

    update_status(&ctx, &name, &current, namespace, dns_address.clone()).await?;
    info!(address = %dns_address, "certificate authority converged");
    Ok(Action::await_change())
}

/// Run every step in order; an error names the step that failed
async fn converge(
    ca: &CertificateAuthority,
    namespace: &str,
    ctx: &CaContext,
) -> Result<(), (ChildKind, Error)> {
    for (kind, build) in STEPS {
        let name = child_name(ca, kind);
        ensure_exists(
            ctx.children.as_ref(),
            ctx.events.as_ref(),
            ca,
            kind,
            namespace,
            &name,
            || build(ca, namespace),
        )
        .await
        .map_err(|e| (kind, e))?;
    }
    Ok(())
}

async fn update_status(
    ctx: &CaContext,
    name: &str,
    current: &CertificateAuthorityStatus,
    namespace: String,
    dns_address: String,
) -> Result<(), Error> {
    let desired = CertificateAuthorityStatus {
        namespace: Some(namespace),
        dns_address: Some(dns_address),
    };
    if desired != *current {
        debug!(?desired, "updating certificate authority status");
        ctx.kube.patch_status(name, &desired).await?;
    }
    Ok(())
}

/// Error policy for the CertificateAuthority controller
pub fn error_policy(ca: Arc<CertificateAuthority>, error: &Error, _ctx: Arc<CaContext>) -> Action {
    error!(
        ?error,
        ca = %ca.name_any(),
        "certificate authority reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        warn!(ca = %ca.name_any(), "not retrying until the resource changes");
        Action::await_change()
    }
}

// =============================================================================
// Child builders
// =============================================================================

fn selector_labels(ca: &CertificateAuthority) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), ca.name_any()),
        (LABEL_COMPONENT.to_string(), COMPONENT_PKI.to_string()),
        (LABEL_PART_OF.to_string(), PART_OF_WIREPACT.to_string()),
    ])
}

fn workload_labels(ca: &CertificateAuthority) -> BTreeMap<String, String> {
    let mut labels = selector_labels(ca);
    labels.insert(LABEL_MANAGED_BY.to_string(), ca.name_any());
    labels.insert(LABEL_CREATED_BY.to_string(), OPERATOR_NAME.to_string());
    labels
}

fn build_service_account(_ca: &CertificateAuthority, _namespace: &str) -> ChildResource {
    ChildResource::ServiceAccount(ServiceAccount::default())
}

fn build_role(ca: &CertificateAuthority, _namespace: &str) -> ChildResource {
    ChildResource::Role(Role {
        metadata: ObjectMeta::default(),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![ca.spec.secret_name.clone()]),
            verbs: vec!["get".to_string(), "update".to_string()],
            ..Default::default()
        }]),
    })
}

fn build_role_binding(ca: &CertificateAuthority, namespace: &str) -> ChildResource {
    ChildResource::RoleBinding(RoleBinding {
        metadata: ObjectMeta::default(),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ca.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: ca.name_any(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    })
}

fn build_secret(_ca: &CertificateAuthority, _namespace: &str) -> ChildResource {
    ChildResource::Secret(Secret {
        string_data: Some(BTreeMap::from([(
            "serialNumber".to_string(),
            "0".to_string(),
        )])),
        ..Default::default()
    })
}

fn tcp_probe(port: u16) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(3),
        ..Default::default()
    }
}

fn build_deployment(ca: &CertificateAuthority, _namespace: &str) -> ChildResource {
    let port = ca.spec.port;
    let container = Container {
        name: ca.name_any(),
        image: Some(ca.spec.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        args: Some(vec![
            format!("--port={port}"),
            format!("--secret-name={}", ca.spec.secret_name),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(GRPC_PORT_NAME.to_string()),
            container_port: i32::from(port),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("50m".to_string())),
                ("memory".to_string(), Quantity("16Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("50m".to_string())),
                ("memory".to_string(), Quantity("32Mi".to_string())),
            ])),
            ..Default::default()
        }),
        readiness_probe: Some(tcp_probe(port)),
        liveness_probe: Some(tcp_probe(port)),
        ..Default::default()
    };

    ChildResource::Deployment(Deployment {
        metadata: ObjectMeta {
            labels: Some(workload_labels(ca)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            revision_history_limit: Some(0),
            selector: LabelSelector {
                match_labels: Some(selector_labels(ca)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(workload_labels(ca)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(ca.name_any()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn build_service(ca: &CertificateAuthority, _namespace: &str) -> ChildResource {
    let port = i32::from(ca.spec.port);
    ChildResource::Service(Service {
        metadata: ObjectMeta {
            labels: Some(workload_labels(ca)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(ca)),
            ports: Some(vec![ServicePort {
                name: Some(GRPC_PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use mockall::Sequence;
    use wirepact_common::crd::CertificateAuthoritySpec;
    use wirepact_common::events::NoopEventPublisher;

    use crate::convergence::MockChildStore;

    fn sample_ca(status: Option<CertificateAuthorityStatus>) -> Arc<CertificateAuthority> {
        let mut ca = CertificateAuthority::new("wirepact-pki", CertificateAuthoritySpec::default());
        ca.metadata.uid = Some("ca-uid".to_string());
        ca.status = status;
        Arc::new(ca)
    }

    fn converged_status() -> CertificateAuthorityStatus {
        CertificateAuthorityStatus {
            namespace: Some("wirepact".to_string()),
            dns_address: Some("wirepact-pki.wirepact:8080".to_string()),
        }
    }

    fn context(kube: MockCaKubeClient, children: MockChildStore) -> Arc<CaContext> {
        Arc::new(CaContext::for_testing(
            Arc::new(kube),
            Arc::new(children),
            Arc::new(NoopEventPublisher),
            Arc::new(OperatorConfig::for_testing("wirepact")),
        ))
    }

    fn unwrap_deployment(child: ChildResource) -> Deployment {
        match child {
            ChildResource::Deployment(d) => d,
            other => panic!("expected deployment, got {:?}", other.kind()),
        }
    }

    /// Story: first reconcile of a fresh CA creates all six children in order
    #[tokio::test]
    async fn story_fresh_ca_creates_children_in_order() {
        let mut seq = Sequence::new();
        let mut children = MockChildStore::new();
        for (kind, _) in STEPS {
            children
                .expect_exists()
                .withf(move |k, ns, _| *k == kind && ns == "wirepact")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(false));
            children
                .expect_create()
                .withf(move |_, child| child.kind() == kind)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let status = Arc::new(Mutex::new(None));
        let sink = status.clone();
        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status().times(1).returning(move |_, s| {
            *sink.lock().unwrap() = Some(s.clone());
            Ok(())
        });

        let action = reconcile(sample_ca(None), context(kube, children))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(status.lock().unwrap().clone(), Some(converged_status()));
    }

    #[tokio::test]
    async fn converged_ca_writes_nothing() {
        let mut children = MockChildStore::new();
        children.expect_exists().times(6).returning(|_, _, _| Ok(true));
        children.expect_create().never();
        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status().never();

        reconcile(sample_ca(Some(converged_status())), context(kube, children))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recorded_namespace_wins_over_operator_namespace() {
        let mut children = MockChildStore::new();
        children
            .expect_exists()
            .withf(|_, ns, _| ns == "pki-home")
            .times(6)
            .returning(|_, _, _| Ok(true));
        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status()
            .withf(|_, s| s.dns_address.as_deref() == Some("wirepact-pki.pki-home:8080"))
            .times(1)
            .returning(|_, _| Ok(()));

        let status = CertificateAuthorityStatus {
            namespace: Some("pki-home".to_string()),
            dns_address: None,
        };
        reconcile(sample_ca(Some(status)), context(kube, children))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_step_aborts_and_keeps_status() {
        let mut children = MockChildStore::new();
        children
            .expect_exists()
            .withf(|k, _, _| *k == ChildKind::ServiceAccount || *k == ChildKind::Role)
            .times(2)
            .returning(|_, _, _| Ok(true));
        children
            .expect_exists()
            .withf(|k, _, _| *k == ChildKind::RoleBinding)
            .times(1)
            .returning(|_, _, _| Ok(false));
        children
            .expect_create()
            .times(1)
            .returning(|_, _| Err(Error::internal("forbidden")));

        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status().never();

        let result = reconcile(sample_ca(Some(converged_status())), context(kube, children)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn transient_lookup_failure_keeps_converged_address() {
        let mut children = MockChildStore::new();
        children
            .expect_exists()
            .withf(|k, _, _| *k == ChildKind::ServiceAccount)
            .times(1)
            .returning(|_, _, _| Err(Error::internal("GET timed out")));
        children.expect_create().never();
        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status().never();

        let result = reconcile(sample_ca(Some(converged_status())), context(kube, children)).await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn failing_service_step_clears_address() {
        let mut children = MockChildStore::new();
        children
            .expect_exists()
            .withf(|k, _, _| *k != ChildKind::Service)
            .times(5)
            .returning(|_, _, _| Ok(true));
        children
            .expect_exists()
            .withf(|k, _, _| *k == ChildKind::Service)
            .times(1)
            .returning(|_, _, _| Ok(false));
        children
            .expect_create()
            .withf(|_, child| child.kind() == ChildKind::Service)
            .times(1)
            .returning(|_, _| Err(Error::internal("quota exceeded")));

        let status = Arc::new(Mutex::new(None));
        let sink = status.clone();
        let mut kube = MockCaKubeClient::new();
        kube.expect_patch_status().times(1).returning(move |_, s| {
            *sink.lock().unwrap() = Some(s.clone());
            Ok(())
        });

        let result = reconcile(sample_ca(Some(converged_status())), context(kube, children)).await;
        assert!(result.is_err());
        let written = status.lock().unwrap().clone().unwrap();
        assert_eq!(written.dns_address.as_deref(), Some(""));
        assert_eq!(written.namespace.as_deref(), Some("wirepact"));
    }

    #[test]
    fn secret_child_uses_secret_name() {
        let ca = sample_ca(None);
        assert_eq!(child_name(&ca, ChildKind::Secret), "wirepact-pki-ca");
        assert_eq!(child_name(&ca, ChildKind::Role), "wirepact-pki");
    }

    #[test]
    fn deployment_shape() {
        let ca = sample_ca(None);
        let deployment = unwrap_deployment(build_deployment(&ca, "wirepact"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.revision_history_limit, Some(0));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()[LABEL_COMPONENT],
            "pki"
        );

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("wirepact-pki"));
        let container = &pod.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.args,
            Some(vec![
                "--port=8080".to_string(),
                "--secret-name=wirepact-pki-ca".to_string()
            ])
        );
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("32Mi".to_string()));
        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(3));

        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_MANAGED_BY], "wirepact-pki");
        assert_eq!(labels[LABEL_CREATED_BY], "wirepact-operator");
    }

    #[test]
    fn role_grants_secret_access() {
        let ca = sample_ca(None);
        let ChildResource::Role(role) = build_role(&ca, "wirepact") else {
            panic!("expected role");
        };
        let rule = &role.rules.unwrap()[0];
        assert_eq!(rule.verbs, vec!["get", "update"]);
        assert_eq!(rule.resources, Some(vec!["secrets".to_string()]));
        assert_eq!(rule.api_groups, Some(vec![String::new()]));
    }

    #[test]
    fn secret_starts_at_serial_zero() {
        let ca = sample_ca(None);
        let ChildResource::Secret(secret) = build_secret(&ca, "wirepact") else {
            panic!("expected secret");
        };
        assert_eq!(secret.string_data.unwrap()["serialNumber"], "0");
    }

    #[test]
    fn service_targets_grpc_port() {
        let ca = sample_ca(None);
        let ChildResource::Service(service) = build_service(&ca, "wirepact") else {
            panic!("expected service");
        };
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("grpc"));
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn retryable_errors_requeue() {
        let ctx = context(MockCaKubeClient::new(), MockChildStore::new());
        assert_eq!(
            error_policy(sample_ca(None), &Error::internal("x"), ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            error_policy(sample_ca(None), &Error::validation("x"), ctx),
            Action::await_change()
        );
    }
}
