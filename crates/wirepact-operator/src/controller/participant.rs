//! MeshParticipant controller
//!
//! Brings a participant's Deployment and Service into the injected shape:
//! allocate ports, redirect the Service, render the proxy bootstrap into a
//! ConfigMap, then add the sidecars in a single Deployment write. A finalizer
//! keeps the participant around until the injection has been undone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use wirepact_common::crd::{
    CertificateAuthority, MeshParticipant, MeshParticipantStatus, TranslatorDefinition,
};
use wirepact_common::kube_utils;
use wirepact_common::Error;

use crate::config::OperatorConfig;
use crate::envoy::{self, EnvoyBootstrap, EnvoyPorts};
use crate::inject::{self, InjectionPlan, RestoreOutcome};
use crate::ports::{self, PortSource, RandomPorts};

/// Finalizer that holds a participant until its injection is undone
pub const PARTICIPANT_FINALIZER: &str = "wirepact.ch/participant-cleanup";

const FIELD_MANAGER: &str = "wirepact-participant-controller";

/// Requeue interval on success; repairs drift on the foreign Deployment and Service
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Trait abstracting Kubernetes access for MeshParticipant reconciliation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParticipantKubeClient: Send + Sync {
    /// Look up a TranslatorDefinition
    async fn get_translator(&self, name: &str) -> Result<Option<TranslatorDefinition>, Error>;

    /// Look up a CertificateAuthority
    async fn get_ca(&self, name: &str) -> Result<Option<CertificateAuthority>, Error>;

    /// Look up a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Look up a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Look up a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a ConfigMap
    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a Deployment
    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Replace a Service
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Merge-patch the status of a MeshParticipant
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshParticipantStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Production [`ParticipantKubeClient`]
pub struct ParticipantKubeClientImpl {
    client: Client,
}

impl ParticipantKubeClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn participants(&self, namespace: &str) -> Api<MeshParticipant> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ParticipantKubeClient for ParticipantKubeClientImpl {
    async fn get_translator(&self, name: &str) -> Result<Option<TranslatorDefinition>, Error> {
        let api: Api<TranslatorDefinition> = Api::all(self.client.clone());
        Ok(kube_utils::get_optional(&api, name).await?)
    }

    async fn get_ca(&self, name: &str) -> Result<Option<CertificateAuthority>, Error> {
        let api: Api<CertificateAuthority> = Api::all(self.client.clone());
        Ok(kube_utils::get_optional(&api, name).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(kube_utils::get_optional(&api, name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(kube_utils::get_optional(&api, name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(kube_utils::get_optional(&api, name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        kube_utils::create(&api, config_map).await?;
        Ok(())
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        kube_utils::replace(&api, config_map).await?;
        Ok(())
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        kube_utils::replace(&api, deployment).await?;
        Ok(())
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        kube_utils::replace(&api, service).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshParticipantStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_status(&self.participants(namespace), name, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        kube_utils::add_finalizer(
            &self.participants(namespace),
            name,
            PARTICIPANT_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer(
            &self.participants(namespace),
            name,
            PARTICIPANT_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

/// Shared context for the MeshParticipant controller
pub struct ParticipantContext {
    /// Kubernetes access (trait object for testability)
    pub kube: Arc<dyn ParticipantKubeClient>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
    /// Random source for new ports
    ports: Mutex<Box<dyn PortSource>>,
}

impl ParticipantContext {
    /// Create a context backed by the given client
    pub fn from_client(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self {
            kube: Arc::new(ParticipantKubeClientImpl::new(client)),
            config,
            ports: Mutex::new(Box::new(RandomPorts::from_entropy())),
        }
    }

    /// Create a context from explicit parts, for tests
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ParticipantKubeClient>,
        config: Arc<OperatorConfig>,
        ports: Box<dyn PortSource>,
    ) -> Self {
        Self {
            kube,
            config,
            ports: Mutex::new(ports),
        }
    }

    fn allocate_ports(
        &self,
        current: MeshParticipantStatus,
        deployment: &Deployment,
        participant: &str,
    ) -> Result<ports::Allocation, Error> {
        let mut source = self.ports.lock().map_err(|_| {
            Error::internal_with_context("participant", "port source lock poisoned")
        })?;
        ports::allocate(
            current,
            ports::deployment_ports(deployment),
            source.as_mut(),
            participant,
        )
    }
}

/// Reconcile a MeshParticipant
#[instrument(skip(participant, ctx), fields(participant = %participant.name_any()))]
pub async fn reconcile(
    participant: Arc<MeshParticipant>,
    ctx: Arc<ParticipantContext>,
) -> Result<Action, Error> {
    let name = participant.name_any();
    let namespace = participant
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "MeshParticipant has no namespace"))?;

    if participant.meta().deletion_timestamp.is_some() {
        if kube_utils::has_finalizer(participant.as_ref(), PARTICIPANT_FINALIZER) {
            info!("participant deleted, removing injection");
            cleanup(&participant, &namespace, &ctx).await?;
            ctx.kube.remove_finalizer(&namespace, &name).await?;
        }
        return Ok(Action::await_change());
    }

    if !kube_utils::has_finalizer(participant.as_ref(), PARTICIPANT_FINALIZER) {
        debug!("adding cleanup finalizer");
        ctx.kube.add_finalizer(&namespace, &name).await?;
    }

    inject(&participant, &namespace, &ctx).await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn inject(
    participant: &MeshParticipant,
    namespace: &str,
    ctx: &ParticipantContext,
) -> Result<(), Error> {
    let name = participant.name_any();
    let spec = &participant.spec;
    let owner = format!("participant {namespace}/{name}");

    let translator = ctx
        .kube
        .get_translator(&spec.translator)
        .await?
        .ok_or_else(|| Error::missing("TranslatorDefinition", &spec.translator, &owner))?;
    let mut deployment = ctx
        .kube
        .get_deployment(namespace, &spec.deployment)
        .await?
        .ok_or_else(|| Error::missing("Deployment", &spec.deployment, &owner))?;
    let mut service = ctx
        .kube
        .get_service(namespace, &spec.service)
        .await?
        .ok_or_else(|| Error::missing("Service", &spec.service, &owner))?;
    let pki_address = pki_address(ctx, &owner).await?;

    let current = participant.status.unwrap_or_default();
    let allocation = ctx.allocate_ports(current, &deployment, &format!("{namespace}/{name}"))?;
    let ports = allocation.status;
    if allocation.changed {
        info!(ports = ?ports.ports(), "allocated participant ports");
        ctx.kube.patch_status(namespace, &name, &ports).await?;
    }

    if inject::redirect_service_port(&mut service, spec.target_port, &owner)? {
        info!(service = %spec.service, target_port = spec.target_port, "redirecting service to proxy");
        ctx.kube.replace_service(namespace, &service).await?;
    }

    let bootstrap = envoy::render(EnvoyPorts {
        ingress: ports.ingress_port,
        egress: ports.egress_port,
        app: spec.target_port,
        translator_ingress: ports.translator_ingress_port,
        translator_egress: ports.translator_egress_port,
    })?;
    let config_map = inject::config_map_name(&name);
    ensure_config_map(participant, namespace, &config_map, &bootstrap, ctx).await?;

    let plan = InjectionPlan {
        participant: name.clone(),
        translator: spec.translator.clone(),
        translator_image: translator.spec.image.clone(),
        envoy_image: ctx.config.envoy_image.clone(),
        pki_address,
        ports,
        env: spec.env.clone(),
        args: spec.args.clone(),
        config_map,
        config_hash: bootstrap.hash,
    };
    if inject::inject_deployment(&mut deployment, &plan)? {
        info!(deployment = %spec.deployment, "updating injected deployment");
        ctx.kube.replace_deployment(namespace, &deployment).await?;
    } else {
        debug!(deployment = %spec.deployment, "deployment already injected");
    }

    Ok(())
}

/// `http://<address>` of the configured CertificateAuthority
async fn pki_address(ctx: &ParticipantContext, owner: &str) -> Result<String, Error> {
    let ca_name = &ctx.config.ca_name;
    let ca = ctx
        .kube
        .get_ca(ca_name)
        .await?
        .ok_or_else(|| Error::missing("CertificateAuthority", ca_name, owner))?;
    let address = ca
        .status
        .as_ref()
        .and_then(|s| s.dns_address())
        .ok_or_else(|| Error::missing("CertificateAuthority address", ca_name, owner))?;
    Ok(format!("http://{address}"))
}

async fn ensure_config_map(
    participant: &MeshParticipant,
    namespace: &str,
    name: &str,
    bootstrap: &EnvoyBootstrap,
    ctx: &ParticipantContext,
) -> Result<(), Error> {
    match ctx.kube.get_config_map(namespace, name).await? {
        Some(mut existing) => {
            if inject::refresh_config_map(&mut existing, bootstrap) {
                info!(config_map = %name, hash = %bootstrap.hash, "updating proxy bootstrap");
                ctx.kube.replace_config_map(namespace, &existing).await?;
            }
        }
        None => {
            let owner = participant.controller_owner_ref(&()).ok_or_else(|| {
                Error::internal_with_context("participant", "participant has no uid")
            })?;
            let config_map = inject::config_map(name, namespace, bootstrap, owner);
            info!(config_map = %name, hash = %bootstrap.hash, "creating proxy bootstrap");
            ctx.kube.create_config_map(namespace, &config_map).await?;
        }
    }
    Ok(())
}

/// Undo the injection on the participant's Deployment and Service.
///
/// Missing objects and already-clean state are logged and skipped.
async fn cleanup(
    participant: &MeshParticipant,
    namespace: &str,
    ctx: &ParticipantContext,
) -> Result<(), Error> {
    let spec = &participant.spec;
    let egress_port = participant.status.map(|s| s.egress_port).unwrap_or(0);

    match ctx.kube.get_deployment(namespace, &spec.deployment).await? {
        Some(mut deployment) => {
            if inject::strip_deployment(&mut deployment, egress_port) {
                info!(deployment = %spec.deployment, "removing sidecars");
                ctx.kube.replace_deployment(namespace, &deployment).await?;
            }
        }
        None => warn!(deployment = %spec.deployment, "deployment not found, skipping cleanup"),
    }

    match ctx.kube.get_service(namespace, &spec.service).await? {
        Some(mut service) => match inject::restore_service_port(&mut service) {
            RestoreOutcome::Restored => {
                info!(service = %spec.service, "restoring service target port");
                ctx.kube.replace_service(namespace, &service).await?;
            }
            RestoreOutcome::MissingAnnotation => {
                warn!(service = %spec.service, "no original target port recorded, leaving service as is");
            }
            RestoreOutcome::MissingIngressPort => {
                warn!(service = %spec.service, "no service port targets the proxy, leaving service as is");
            }
        },
        None => warn!(service = %spec.service, "service not found, skipping cleanup"),
    }

    Ok(())
}

/// Error policy for the MeshParticipant controller
pub fn error_policy(
    participant: Arc<MeshParticipant>,
    error: &Error,
    _ctx: Arc<ParticipantContext>,
) -> Action {
    error!(
        ?error,
        participant = %participant.name_any(),
        namespace = ?participant.namespace(),
        "participant reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;
    use wirepact_common::crd::{
        CertificateAuthorityStatus, CertificateAuthoritySpec, MeshParticipantSpec,
    };

    use crate::inject::{
        CONFIG_VOLUME, ENVOY_CONTAINER, HTTP_PROXY_ENV, ORIGINAL_TARGET_PORT_ANNOTATION,
        TRANSLATOR_CONTAINER,
    };
    use crate::ports::ScriptedPorts;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct Writes {
        status: usize,
        service: usize,
        config_map: usize,
        deployment: usize,
        finalizer: usize,
    }

    /// In-memory cluster the mock client reads from and writes to
    #[derive(Default)]
    struct Cluster {
        translator: Option<TranslatorDefinition>,
        ca: Option<CertificateAuthority>,
        deployment: Option<Deployment>,
        service: Option<Service>,
        config_map: Option<ConfigMap>,
        status: Option<MeshParticipantStatus>,
        writes: Writes,
    }

    type Shared = Arc<Mutex<Cluster>>;

    fn app_deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            image: Some("app:1".to_string()),
                            ports: Some(vec![ContainerPort {
                                container_port: 8080,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_port(port: i32) -> ServicePort {
        ServicePort {
            name: Some(format!("http-{port}")),
            port,
            target_port: Some(IntOrString::Int(port)),
            ..Default::default()
        }
    }

    fn app_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![service_port(8080), service_port(8081)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_ca() -> CertificateAuthority {
        let mut ca = CertificateAuthority::new("wirepact-pki", CertificateAuthoritySpec::default());
        ca.status = Some(CertificateAuthorityStatus {
            namespace: Some("wirepact".to_string()),
            dns_address: Some("wirepact-pki.wirepact:8080".to_string()),
        });
        ca
    }

    fn cluster() -> Shared {
        Arc::new(Mutex::new(Cluster {
            translator: Some(TranslatorDefinition::entry("basic-auth", "translator:1")),
            ca: Some(ready_ca()),
            deployment: Some(app_deployment()),
            service: Some(app_service()),
            ..Default::default()
        }))
    }

    fn participant(state: &Shared, target_port: u16) -> Arc<MeshParticipant> {
        let mut p = MeshParticipant::new(
            "web",
            MeshParticipantSpec {
                deployment: "web".to_string(),
                service: "web".to_string(),
                target_port,
                translator: "basic-auth".to_string(),
                env: BTreeMap::from([("REPO".to_string(), "users".to_string())]),
                args: vec![],
            },
        );
        p.metadata.namespace = Some("default".to_string());
        p.metadata.uid = Some("participant-uid".to_string());
        p.metadata.finalizers = Some(vec![PARTICIPANT_FINALIZER.to_string()]);
        p.status = state.lock().unwrap().status;
        Arc::new(p)
    }

    fn deleting(p: Arc<MeshParticipant>) -> Arc<MeshParticipant> {
        let mut p = (*p).clone();
        p.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        Arc::new(p)
    }

    fn mock_client(state: &Shared) -> MockParticipantKubeClient {
        let mut mock = MockParticipantKubeClient::new();

        let s = state.clone();
        mock.expect_get_translator()
            .returning(move |_| Ok(s.lock().unwrap().translator.clone()));
        let s = state.clone();
        mock.expect_get_ca()
            .returning(move |_| Ok(s.lock().unwrap().ca.clone()));
        let s = state.clone();
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(s.lock().unwrap().deployment.clone()));
        let s = state.clone();
        mock.expect_get_service()
            .returning(move |_, _| Ok(s.lock().unwrap().service.clone()));
        let s = state.clone();
        mock.expect_get_config_map()
            .returning(move |_, _| Ok(s.lock().unwrap().config_map.clone()));

        let s = state.clone();
        mock.expect_create_config_map().returning(move |_, cm| {
            let mut st = s.lock().unwrap();
            st.config_map = Some(cm.clone());
            st.writes.config_map += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_replace_config_map().returning(move |_, cm| {
            let mut st = s.lock().unwrap();
            st.config_map = Some(cm.clone());
            st.writes.config_map += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_replace_deployment().returning(move |_, d| {
            let mut st = s.lock().unwrap();
            st.deployment = Some(d.clone());
            st.writes.deployment += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_replace_service().returning(move |_, svc| {
            let mut st = s.lock().unwrap();
            st.service = Some(svc.clone());
            st.writes.service += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            let mut st = s.lock().unwrap();
            st.status = Some(*status);
            st.writes.status += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_add_finalizer().returning(move |_, _| {
            s.lock().unwrap().writes.finalizer += 1;
            Ok(())
        });
        let s = state.clone();
        mock.expect_remove_finalizer().returning(move |_, _| {
            s.lock().unwrap().writes.finalizer += 1;
            Ok(())
        });

        mock
    }

    fn context(state: &Shared, ports: &[u16]) -> Arc<ParticipantContext> {
        Arc::new(ParticipantContext::for_testing(
            Arc::new(mock_client(state)),
            Arc::new(OperatorConfig::for_testing("wirepact")),
            Box::new(ScriptedPorts::new(ports)),
        ))
    }

    fn writes(state: &Shared) -> Writes {
        state.lock().unwrap().writes
    }

    fn reset_writes(state: &Shared) {
        state.lock().unwrap().writes = Writes::default();
    }

    fn pod_of(state: &Shared) -> PodSpec {
        let st = state.lock().unwrap();
        st.deployment
            .as_ref()
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.template.spec.clone())
            .unwrap()
    }

    fn service_ports_of(state: &Shared) -> Vec<ServicePort> {
        let st = state.lock().unwrap();
        st.service
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.ports.clone())
            .unwrap()
    }

    const PORTS: [u16; 4] = [41000, 41001, 41002, 41003];

    /// Story: a fresh participant gets ports, a redirected service, a
    /// bootstrap ConfigMap and both sidecars, then stays put
    #[tokio::test]
    async fn story_fresh_participant_is_injected_then_idempotent() {
        let state = cluster();

        let action = reconcile(participant(&state, 8080), context(&state, &PORTS))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(
            writes(&state),
            Writes {
                status: 1,
                service: 1,
                config_map: 1,
                deployment: 1,
                finalizer: 0,
            }
        );
        assert_eq!(
            state.lock().unwrap().status.map(|s| s.ports()),
            Some(PORTS)
        );

        let pod = pod_of(&state);
        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["app", TRANSLATOR_CONTAINER, ENVOY_CONTAINER]);
        let translator = &pod.containers[1];
        let pki = translator
            .env
            .iter()
            .flatten()
            .find(|e| e.name == "PKI_ADDRESS")
            .and_then(|e| e.value.clone());
        assert_eq!(pki.as_deref(), Some("http://wirepact-pki.wirepact:8080"));

        let ports = service_ports_of(&state);
        assert_eq!(
            ports[0].target_port,
            Some(IntOrString::String("ingress".to_string()))
        );

        let cm = state.lock().unwrap().config_map.clone().unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("envoy-web"));
        assert_eq!(
            cm.metadata.owner_references.unwrap()[0].uid,
            "participant-uid"
        );

        // Second pass on converged state writes nothing
        reset_writes(&state);
        reconcile(participant(&state, 8080), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(writes(&state), Writes::default());
    }

    #[tokio::test]
    async fn config_map_writes_follow_bootstrap_changes() {
        let state = cluster();
        reconcile(participant(&state, 8080), context(&state, &PORTS))
            .await
            .unwrap();
        reconcile(participant(&state, 8080), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(writes(&state).config_map, 1);

        let hash_before = state.lock().unwrap().config_map.clone().unwrap().data.unwrap()
            [inject::HASH_KEY]
            .clone();

        reconcile(participant(&state, 8081), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(writes(&state).config_map, 2);

        let hash_after = state.lock().unwrap().config_map.clone().unwrap().data.unwrap()
            [inject::HASH_KEY]
            .clone();
        assert_ne!(hash_before, hash_after);

        // the proxy picks up the new fingerprint so pods roll
        let pod = pod_of(&state);
        let envoy = pod.containers.iter().find(|c| c.name == ENVOY_CONTAINER).unwrap();
        let env_hash = envoy
            .env
            .iter()
            .flatten()
            .find(|e| e.name == inject::CONFIG_HASH_ENV)
            .and_then(|e| e.value.clone());
        assert_eq!(env_hash, Some(hash_after));
    }

    #[tokio::test]
    async fn existing_ports_are_never_redrawn() {
        let state = cluster();
        state.lock().unwrap().status = Some(MeshParticipantStatus::from_ports(PORTS));

        // an empty script panics if a port is drawn
        reconcile(participant(&state, 8080), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(writes(&state).status, 0);
    }

    #[tokio::test]
    async fn deletion_reverses_injection() {
        let state = cluster();
        reconcile(participant(&state, 8080), context(&state, &PORTS))
            .await
            .unwrap();
        reset_writes(&state);

        let action = reconcile(deleting(participant(&state, 8080)), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(
            writes(&state),
            Writes {
                service: 1,
                deployment: 1,
                finalizer: 1,
                ..Default::default()
            }
        );

        let pod = pod_of(&state);
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, "app");
        assert!(!pod.containers[0]
            .env
            .iter()
            .flatten()
            .any(|e| e.name == HTTP_PROXY_ENV));
        assert!(!pod.volumes.iter().flatten().any(|v| v.name == CONFIG_VOLUME));

        let ports = service_ports_of(&state);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
        let st = state.lock().unwrap();
        let annotations = st.service.as_ref().unwrap().metadata.annotations.clone();
        assert!(!annotations
            .unwrap_or_default()
            .contains_key(ORIGINAL_TARGET_PORT_ANNOTATION));
    }

    #[tokio::test]
    async fn deletion_tolerates_missing_workload() {
        let state = cluster();
        {
            let mut st = state.lock().unwrap();
            st.deployment = None;
            st.service = None;
        }
        reconcile(deleting(participant(&state, 8080)), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(
            writes(&state),
            Writes {
                finalizer: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn deletion_of_clean_workload_only_drops_finalizer() {
        let state = cluster();
        reconcile(deleting(participant(&state, 8080)), context(&state, &[]))
            .await
            .unwrap();
        assert_eq!(
            writes(&state),
            Writes {
                finalizer: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn missing_translator_is_a_reference_error() {
        let state = cluster();
        state.lock().unwrap().translator = None;
        let err = reconcile(participant(&state, 8080), context(&state, &PORTS))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingReference { ref kind, .. } if kind == "TranslatorDefinition"));
        assert!(err.is_retryable());
        assert_eq!(writes(&state), Writes::default());
    }

    #[tokio::test]
    async fn missing_service_port_aborts_before_deployment_write() {
        let state = cluster();
        let err = reconcile(participant(&state, 9999), context(&state, &PORTS))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingReference { ref kind, .. } if kind == "ServicePort"));
        assert_eq!(writes(&state).deployment, 0);
        assert_eq!(writes(&state).config_map, 0);
    }

    #[tokio::test]
    async fn ca_without_address_is_a_reference_error() {
        let state = cluster();
        state.lock().unwrap().ca = Some(CertificateAuthority::new(
            "wirepact-pki",
            CertificateAuthoritySpec::default(),
        ));
        let err = reconcile(participant(&state, 8080), context(&state, &PORTS))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingReference { .. }));
        assert_eq!(writes(&state), Writes::default());
    }

    #[tokio::test]
    async fn finalizer_is_added_on_first_sight() {
        let state = cluster();
        let mut p = (*participant(&state, 8080)).clone();
        p.metadata.finalizers = None;
        reconcile(Arc::new(p), context(&state, &PORTS)).await.unwrap();
        assert_eq!(writes(&state).finalizer, 1);
    }

    #[test]
    fn error_policy_requeues_retryable_errors() {
        let state = cluster();
        let ctx = context(&state, &[]);
        let p = participant(&state, 8080);
        assert_eq!(
            error_policy(p.clone(), &Error::missing("Deployment", "web", "x"), ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            error_policy(p, &Error::validation("bad"), ctx),
            Action::await_change()
        );
    }
}
