//! Sidecar injection into foreign Deployments and Services
//!
//! The participant's Deployment and Service belong to the workload owner. The
//! operator only touches what it can recognise again later: the two reserved
//! containers, the reserved volume, the `HTTP_PROXY` variable it added, and
//! the Service port it redirected (whose original target is kept in an
//! annotation). Everything here is a pure function over k8s-openapi types that
//! reports whether it changed anything, so the controller can skip writes on
//! converged state.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, Service,
    ServicePort, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use wirepact_common::crd::MeshParticipantStatus;
use wirepact_common::{Error, LABEL_MANAGED_BY, LABEL_PART_OF, OPERATOR_NAME, PART_OF_WIREPACT};

use crate::envoy::EnvoyBootstrap;

/// Name of the translator sidecar
pub const TRANSLATOR_CONTAINER: &str = "wirepact-translator";
/// Name of the proxy sidecar
pub const ENVOY_CONTAINER: &str = "wirepact-envoy";
/// Name of the volume carrying the proxy bootstrap
pub const CONFIG_VOLUME: &str = "wirepact-envoy-config";
/// Annotation on the Service holding the original target port
pub const ORIGINAL_TARGET_PORT_ANNOTATION: &str = "wirepact.ch/original-target-port";
/// Name of the proxy's inbound container port, used as the Service target
pub const INGRESS_PORT_NAME: &str = "ingress";
/// ConfigMap key of the bootstrap document
pub const CONFIG_KEY: &str = "envoy-config.yaml";
/// ConfigMap key of the bootstrap fingerprint
pub const HASH_KEY: &str = "config-hash";
/// Proxy env var carrying the bootstrap fingerprint; a change rolls the pods
pub const CONFIG_HASH_ENV: &str = "ENVOY_CONFIG_HASH";
/// Path the proxy reads its bootstrap from
pub const CONFIG_MOUNT_PATH: &str = "/config/envoy.yaml";
/// Env var pointing the workload's outbound traffic at the proxy
pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";

/// Name of the bootstrap ConfigMap for a participant
pub fn config_map_name(participant: &str) -> String {
    format!("envoy-{participant}")
}

/// `HTTP_PROXY` value for a given egress port
pub fn http_proxy_value(egress_port: u16) -> String {
    format!("http://localhost:{egress_port}")
}

/// Everything needed to bring a participant's Deployment into shape
#[derive(Clone, Debug)]
pub struct InjectionPlan {
    /// Participant name
    pub participant: String,
    /// Name of the referenced TranslatorDefinition
    pub translator: String,
    /// Image of the translator
    pub translator_image: String,
    /// Image of the proxy
    pub envoy_image: String,
    /// `http://<ca address>`
    pub pki_address: String,
    /// Allocated ports
    pub ports: MeshParticipantStatus,
    /// User environment for the translator
    pub env: BTreeMap<String, String>,
    /// User arguments for the translator
    pub args: Vec<String>,
    /// Name of the bootstrap ConfigMap
    pub config_map: String,
    /// Fingerprint of the current bootstrap
    pub config_hash: String,
}

impl InjectionPlan {
    /// The env vars the operator computes for the translator
    fn translator_env(&self) -> [(&'static str, String); 4] {
        [
            (
                "COMMON_NAME",
                format!("{}-{}", self.translator, self.participant),
            ),
            (
                "INGRESS_PORT",
                self.ports.translator_ingress_port.to_string(),
            ),
            ("EGRESS_PORT", self.ports.translator_egress_port.to_string()),
            ("PKI_ADDRESS", self.pki_address.clone()),
        ]
    }
}

// =============================================================================
// Container helpers
// =============================================================================

/// Set an env var on the container, adding it if absent.
///
/// Returns true if the container changed.
pub fn ensure_env(container: &mut Container, name: &str, value: &str) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(var) if var.value.as_deref() == Some(value) && var.value_from.is_none() => false,
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
            true
        }
        None => {
            env.push(env_var(name, value));
            true
        }
    }
}

/// Declare a container port, adding it if absent and fixing its name otherwise.
///
/// Returns true if the container changed.
pub fn ensure_port(container: &mut Container, port: u16, name: Option<&str>) -> bool {
    let ports = container.ports.get_or_insert_with(Vec::new);
    match ports
        .iter_mut()
        .find(|p| p.container_port == i32::from(port))
    {
        Some(p) if p.name.as_deref() == name => false,
        Some(p) => {
            p.name = name.map(str::to_string);
            true
        }
        None => {
            ports.push(container_port(port, name));
            true
        }
    }
}

fn ensure_image(container: &mut Container, image: &str) -> bool {
    if container.image.as_deref() == Some(image) {
        return false;
    }
    container.image = Some(image.to_string());
    true
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn container_port(port: u16, name: Option<&str>) -> ContainerPort {
    ContainerPort {
        container_port: i32::from(port),
        name: name.map(str::to_string),
        ..Default::default()
    }
}

fn config_mount() -> VolumeMount {
    VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        sub_path: Some(CONFIG_KEY.to_string()),
        ..Default::default()
    }
}

fn is_reserved(container: &Container) -> bool {
    container.name == TRANSLATOR_CONTAINER || container.name == ENVOY_CONTAINER
}

fn pod_spec_mut(deployment: &mut Deployment) -> Result<&mut PodSpec, Error> {
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| {
            Error::internal_with_context("inject", "deployment has no pod template spec")
        })
}

// =============================================================================
// Injection
// =============================================================================

/// Build a fresh translator sidecar.
///
/// Computed variables win over user variables of the same name.
pub fn translator_container(plan: &InjectionPlan) -> Container {
    let mut env: BTreeMap<&str, String> = plan
        .env
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    for (name, value) in plan.translator_env() {
        env.insert(name, value);
    }

    Container {
        name: TRANSLATOR_CONTAINER.to_string(),
        image: Some(plan.translator_image.clone()),
        ports: Some(vec![
            container_port(plan.ports.translator_ingress_port, None),
            container_port(plan.ports.translator_egress_port, None),
        ]),
        env: Some(env.into_iter().map(|(k, v)| env_var(k, &v)).collect()),
        args: (!plan.args.is_empty()).then(|| plan.args.clone()),
        ..Default::default()
    }
}

/// Build a fresh proxy sidecar.
pub fn envoy_container(plan: &InjectionPlan) -> Container {
    Container {
        name: ENVOY_CONTAINER.to_string(),
        image: Some(plan.envoy_image.clone()),
        command: Some(vec![
            "envoy".to_string(),
            "-c".to_string(),
            CONFIG_MOUNT_PATH.to_string(),
        ]),
        ports: Some(vec![
            container_port(plan.ports.ingress_port, Some(INGRESS_PORT_NAME)),
            container_port(plan.ports.egress_port, None),
        ]),
        env: Some(vec![env_var(CONFIG_HASH_ENV, &plan.config_hash)]),
        volume_mounts: Some(vec![config_mount()]),
        ..Default::default()
    }
}

/// Add or reconcile the translator sidecar.
pub fn ensure_translator(pod: &mut PodSpec, plan: &InjectionPlan) -> bool {
    let Some(idx) = pod
        .containers
        .iter()
        .position(|c| c.name == TRANSLATOR_CONTAINER)
    else {
        pod.containers.push(translator_container(plan));
        return true;
    };
    let container = &mut pod.containers[idx];

    let computed = plan.translator_env();
    let mut changed = ensure_image(container, &plan.translator_image);
    for (name, value) in &plan.env {
        if !computed.iter().any(|(n, _)| n == name) {
            changed |= ensure_env(container, name, value);
        }
    }
    for (name, value) in &computed {
        changed |= ensure_env(container, name, value);
    }
    changed |= ensure_port(container, plan.ports.translator_ingress_port, None);
    changed |= ensure_port(container, plan.ports.translator_egress_port, None);

    if container.args.as_deref().unwrap_or_default() != plan.args.as_slice() {
        container.args = (!plan.args.is_empty()).then(|| plan.args.clone());
        changed = true;
    }
    changed
}

/// Add the bootstrap volume, or point it back at the ConfigMap.
pub fn ensure_config_volume(pod: &mut PodSpec, config_map: &str) -> bool {
    let wanted = Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == CONFIG_VOLUME) {
        Some(v) if v.config_map.as_ref().map(|c| c.name.as_str()) == Some(config_map) => false,
        Some(v) => {
            *v = wanted;
            true
        }
        None => {
            volumes.push(wanted);
            true
        }
    }
}

/// Add or reconcile the proxy sidecar.
pub fn ensure_envoy(pod: &mut PodSpec, plan: &InjectionPlan) -> bool {
    let Some(idx) = pod.containers.iter().position(|c| c.name == ENVOY_CONTAINER) else {
        pod.containers.push(envoy_container(plan));
        return true;
    };
    let container = &mut pod.containers[idx];

    let mut changed = ensure_image(container, &plan.envoy_image);
    changed |= ensure_port(container, plan.ports.ingress_port, Some(INGRESS_PORT_NAME));
    changed |= ensure_port(container, plan.ports.egress_port, None);
    changed |= ensure_env(container, CONFIG_HASH_ENV, &plan.config_hash);

    let expected = [config_mount()];
    if container.volume_mounts.as_deref() != Some(&expected[..]) {
        container.volume_mounts = Some(expected.to_vec());
        changed = true;
    }
    changed
}

/// Give every workload container without `HTTP_PROXY` the proxy's egress address.
pub fn ensure_http_proxy(pod: &mut PodSpec, egress_port: u16) -> bool {
    let value = http_proxy_value(egress_port);
    let mut changed = false;
    for container in pod.containers.iter_mut().filter(|c| !is_reserved(c)) {
        let has_proxy = container
            .env
            .iter()
            .flatten()
            .any(|e| e.name == HTTP_PROXY_ENV);
        if !has_proxy {
            container
                .env
                .get_or_insert_with(Vec::new)
                .push(env_var(HTTP_PROXY_ENV, &value));
            changed = true;
        }
    }
    changed
}

/// Bring the Deployment's pod template to the injected shape.
///
/// Runs the translator, volume, proxy and `HTTP_PROXY` steps in that order and
/// returns true if any of them changed the Deployment.
pub fn inject_deployment(deployment: &mut Deployment, plan: &InjectionPlan) -> Result<bool, Error> {
    let pod = pod_spec_mut(deployment)?;
    let mut changed = ensure_translator(pod, plan);
    changed |= ensure_config_volume(pod, &plan.config_map);
    changed |= ensure_envoy(pod, plan);
    changed |= ensure_http_proxy(pod, plan.ports.egress_port);
    Ok(changed)
}

/// Remove everything [`inject_deployment`] added.
///
/// `HTTP_PROXY` is only removed where it points at a local proxy: the exact
/// egress address when the egress port is known, any `http://localhost:`
/// address otherwise. Values the workload owner set themselves survive.
/// A list emptied by the removal is dropped, since injection created it.
pub fn strip_deployment(deployment: &mut Deployment, egress_port: u16) -> bool {
    let Some(pod) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return false;
    };

    let before = pod.containers.len();
    pod.containers.retain(|c| !is_reserved(c));
    let mut changed = pod.containers.len() != before;

    let injected = |value: Option<&str>| match (value, egress_port) {
        (Some(v), 0) => v.starts_with("http://localhost:"),
        (Some(v), port) => v == http_proxy_value(port),
        (None, _) => false,
    };
    for container in pod.containers.iter_mut() {
        changed |= retain_or_drop(&mut container.env, |e| {
            !(e.name == HTTP_PROXY_ENV && injected(e.value.as_deref()))
        });
    }
    changed |= retain_or_drop(&mut pod.volumes, |v| v.name != CONFIG_VOLUME);

    changed
}

/// `retain` on an optional list; a list this call emptied becomes `None`.
///
/// Returns true if anything was removed.
fn retain_or_drop<T>(list: &mut Option<Vec<T>>, keep: impl FnMut(&T) -> bool) -> bool {
    let Some(items) = list.as_mut() else {
        return false;
    };
    let before = items.len();
    items.retain(keep);
    if items.len() == before {
        return false;
    }
    if items.is_empty() {
        *list = None;
    }
    true
}

// =============================================================================
// Bootstrap ConfigMap
// =============================================================================

/// Build the bootstrap ConfigMap owned by the participant.
pub fn config_map(
    name: &str,
    namespace: &str,
    bootstrap: &EnvoyBootstrap,
    owner: OwnerReference,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_PART_OF.to_string(), PART_OF_WIREPACT.to_string()),
                (LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (CONFIG_KEY.to_string(), bootstrap.config.clone()),
            (HASH_KEY.to_string(), bootstrap.hash.clone()),
        ])),
        ..Default::default()
    }
}

/// Overwrite both keys if the stored fingerprint is missing or differs.
///
/// Returns true if the ConfigMap changed.
pub fn refresh_config_map(cm: &mut ConfigMap, bootstrap: &EnvoyBootstrap) -> bool {
    let data = cm.data.get_or_insert_with(BTreeMap::new);
    if data.get(HASH_KEY) == Some(&bootstrap.hash) {
        return false;
    }
    data.insert(CONFIG_KEY.to_string(), bootstrap.config.clone());
    data.insert(HASH_KEY.to_string(), bootstrap.hash.clone());
    true
}

// =============================================================================
// Service redirection
// =============================================================================

/// Point the Service port `target_port` at the proxy's ingress port.
///
/// The original target is stored in an annotation. If the port already
/// targets the proxy nothing changes.
pub fn redirect_service_port(
    service: &mut Service,
    target_port: u16,
    owner: &str,
) -> Result<bool, Error> {
    let service_name = service.metadata.name.clone().unwrap_or_default();
    let port = service
        .spec
        .as_mut()
        .and_then(|s| s.ports.as_mut())
        .and_then(|ports| {
            ports
                .iter_mut()
                .find(|p| p.port == i32::from(target_port))
        })
        .ok_or_else(|| {
            Error::missing(
                "ServicePort",
                format!("{service_name}:{target_port}"),
                owner,
            )
        })?;

    if targets_ingress(port) {
        return Ok(false);
    }

    let original = match &port.target_port {
        Some(IntOrString::Int(i)) => i.to_string(),
        Some(IntOrString::String(s)) => s.clone(),
        None => port.port.to_string(),
    };
    port.target_port = Some(IntOrString::String(INGRESS_PORT_NAME.to_string()));
    service
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ORIGINAL_TARGET_PORT_ANNOTATION.to_string(), original);
    Ok(true)
}

/// Outcome of restoring a redirected Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Target restored and annotation removed; the Service must be written
    Restored,
    /// No annotation; nothing to restore
    MissingAnnotation,
    /// Annotation present but no port targets the proxy
    MissingIngressPort,
}

/// Undo [`redirect_service_port`].
pub fn restore_service_port(service: &mut Service) -> RestoreOutcome {
    let Some(original) = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ORIGINAL_TARGET_PORT_ANNOTATION))
        .cloned()
    else {
        return RestoreOutcome::MissingAnnotation;
    };

    let Some(port) = service
        .spec
        .as_mut()
        .and_then(|s| s.ports.as_mut())
        .and_then(|ports| ports.iter_mut().find(|p| targets_ingress(p)))
    else {
        return RestoreOutcome::MissingIngressPort;
    };

    port.target_port = Some(match original.parse::<i32>() {
        Ok(n) => IntOrString::Int(n),
        Err(_) => IntOrString::String(original),
    });
    if let Some(annotations) = service.metadata.annotations.as_mut() {
        annotations.remove(ORIGINAL_TARGET_PORT_ANNOTATION);
    }
    RestoreOutcome::Restored
}

fn targets_ingress(port: &ServicePort) -> bool {
    matches!(&port.target_port, Some(IntOrString::String(s)) if s == INGRESS_PORT_NAME)
}
