//! Create-if-missing convergence for objects owned by a CertificateAuthority
//!
//! Children are never updated once they exist. A missing child is built,
//! stamped with a controller owner reference so deletion cascades, created,
//! and announced with a `<KIND>_CREATED` or `<KIND>_FAILED` event on the owner.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ObjectMeta};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info};

use wirepact_common::crd::CertificateAuthority;
use wirepact_common::events::{actions, reasons, EventPublisher};
use wirepact_common::kube_utils;
use wirepact_common::Error;

/// Kinds of objects the CA manager converges
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    /// ServiceAccount the CA pod runs as
    ServiceAccount,
    /// Role granting access to the CA secret
    Role,
    /// Binding of the role to the account
    RoleBinding,
    /// Secret holding CA key material
    Secret,
    /// CA workload
    Deployment,
    /// CA service
    Service,
}

impl ChildKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::Secret => "Secret",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
        }
    }

    /// Upper snake case prefix of event reasons
    pub fn event_prefix(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "SERVICE_ACCOUNT",
            Self::Role => "ROLE",
            Self::RoleBinding => "ROLE_BINDING",
            Self::Secret => "SECRET",
            Self::Deployment => "DEPLOYMENT",
            Self::Service => "SERVICE",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A built child object
#[derive(Clone, Debug, PartialEq)]
pub enum ChildResource {
    /// ServiceAccount
    ServiceAccount(ServiceAccount),
    /// Role
    Role(Role),
    /// RoleBinding
    RoleBinding(RoleBinding),
    /// Secret
    Secret(Secret),
    /// Deployment
    Deployment(Deployment),
    /// Service
    Service(Service),
}

impl ChildResource {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ServiceAccount(_) => ChildKind::ServiceAccount,
            Self::Role(_) => ChildKind::Role,
            Self::RoleBinding(_) => ChildKind::RoleBinding,
            Self::Secret(_) => ChildKind::Secret,
            Self::Deployment(_) => ChildKind::Deployment,
            Self::Service(_) => ChildKind::Service,
        }
    }

    /// Metadata of the wrapped object
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &o.metadata,
            Self::Role(o) => &o.metadata,
            Self::RoleBinding(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ServiceAccount(o) => &mut o.metadata,
            Self::Role(o) => &mut o.metadata,
            Self::RoleBinding(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::Deployment(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
        }
    }

    /// Set name, namespace and the controller owner reference
    fn stamp(&mut self, name: &str, namespace: &str, owner: &CertificateAuthority) -> Result<(), Error> {
        let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("convergence", "certificate authority has no uid")
        })?;
        let meta = self.metadata_mut();
        meta.name = Some(name.to_string());
        meta.namespace = Some(namespace.to_string());
        meta.owner_references = Some(vec![owner_ref]);
        Ok(())
    }
}

/// Namespaced access to child objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChildStore: Send + Sync {
    /// Whether a child of the given kind and name exists
    async fn exists(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Create a child
    async fn create(&self, namespace: &str, child: ChildResource) -> Result<(), Error>;
}

/// Production [`ChildStore`] backed by typed `Api`s
pub struct ChildStoreImpl {
    client: Client,
}

impl ChildStoreImpl {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ChildStore for ChildStoreImpl {
    async fn exists(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<bool, Error> {
        let found = match kind {
            ChildKind::ServiceAccount => {
                kube_utils::exists(&self.api::<ServiceAccount>(namespace), name).await?
            }
            ChildKind::Role => kube_utils::exists(&self.api::<Role>(namespace), name).await?,
            ChildKind::RoleBinding => {
                kube_utils::exists(&self.api::<RoleBinding>(namespace), name).await?
            }
            ChildKind::Secret => kube_utils::exists(&self.api::<Secret>(namespace), name).await?,
            ChildKind::Deployment => {
                kube_utils::exists(&self.api::<Deployment>(namespace), name).await?
            }
            ChildKind::Service => kube_utils::exists(&self.api::<Service>(namespace), name).await?,
        };
        Ok(found)
    }

    async fn create(&self, namespace: &str, child: ChildResource) -> Result<(), Error> {
        match child {
            ChildResource::ServiceAccount(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
            ChildResource::Role(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
            ChildResource::RoleBinding(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
            ChildResource::Secret(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
            ChildResource::Deployment(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
            ChildResource::Service(o) => {
                kube_utils::create(&self.api(namespace), &o).await?;
            }
        }
        Ok(())
    }
}

/// Make sure a child exists, creating it with `build` if it does not.
///
/// Returns true if the child was created. `build` is only called when the
/// child is missing. Create failures are logged, published as a Warning
/// event on the owner, and returned.
pub async fn ensure_exists<F>(
    store: &dyn ChildStore,
    events: &dyn EventPublisher,
    owner: &CertificateAuthority,
    kind: ChildKind,
    namespace: &str,
    name: &str,
    build: F,
) -> Result<bool, Error>
where
    F: FnOnce() -> ChildResource,
{
    if store.exists(kind, namespace, name).await? {
        debug!(%kind, %namespace, %name, "child already exists");
        return Ok(false);
    }

    let mut child = build();
    debug_assert_eq!(child.kind(), kind);
    child.stamp(name, namespace, owner)?;

    let owner_ref = owner.object_ref(&());
    match store.create(namespace, child).await {
        Ok(()) => {
            info!(%kind, %namespace, %name, owner = %owner.name_any(), "created child");
            events
                .publish(
                    &owner_ref,
                    EventType::Normal,
                    &reasons::for_kind(kind.event_prefix(), reasons::CREATED_SUFFIX),
                    actions::CREATE,
                    Some(format!("Created {kind} {namespace}/{name}")),
                )
                .await;
            Ok(true)
        }
        Err(e) => {
            error!(%kind, %namespace, %name, error = %e, "failed to create child");
            events
                .publish(
                    &owner_ref,
                    EventType::Warning,
                    &reasons::for_kind(kind.event_prefix(), reasons::FAILED_SUFFIX),
                    actions::CREATE,
                    Some(format!("Could not create {kind} {namespace}/{name}: {e}")),
                )
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use k8s_openapi::api::core::v1::ObjectReference;
    use wirepact_common::crd::CertificateAuthoritySpec;

    /// Records every published reason and type
    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.events
                .lock()
                .unwrap()
                .push((format!("{type_:?}"), reason.to_string()));
        }
    }

    fn owner() -> CertificateAuthority {
        let mut ca = CertificateAuthority::new("wirepact-pki", CertificateAuthoritySpec::default());
        ca.metadata.uid = Some("uid-1".to_string());
        ca
    }

    fn account() -> ChildResource {
        ChildResource::ServiceAccount(ServiceAccount::default())
    }

    #[tokio::test]
    async fn existing_child_is_left_alone() {
        let mut store = MockChildStore::new();
        store.expect_exists().times(1).returning(|_, _, _| Ok(true));
        store.expect_create().never();
        let events = RecordingPublisher::default();

        let created = ensure_exists(
            &store,
            &events,
            &owner(),
            ChildKind::ServiceAccount,
            "wirepact",
            "wirepact-pki",
            || panic!("builder must not run for existing children"),
        )
        .await
        .unwrap();

        assert!(!created);
        assert!(events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_child_is_created_with_owner_reference() {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();

        let mut store = MockChildStore::new();
        store.expect_exists().returning(|_, _, _| Ok(false));
        store.expect_create().times(1).returning(move |ns, child| {
            assert_eq!(ns, "wirepact");
            *sink.lock().unwrap() = Some(child);
            Ok(())
        });
        let events = RecordingPublisher::default();

        let created = ensure_exists(
            &store,
            &events,
            &owner(),
            ChildKind::ServiceAccount,
            "wirepact",
            "wirepact-pki",
            account,
        )
        .await
        .unwrap();
        assert!(created);

        let child = captured.lock().unwrap().take().unwrap();
        let meta = child.metadata();
        assert_eq!(meta.name.as_deref(), Some("wirepact-pki"));
        assert_eq!(meta.namespace.as_deref(), Some("wirepact"));
        let refs = meta.owner_references.as_ref().unwrap();
        assert_eq!(refs[0].uid, "uid-1");
        assert_eq!(refs[0].kind, "CertificateAuthority");
        assert_eq!(refs[0].controller, Some(true));

        assert_eq!(
            *events.events.lock().unwrap(),
            vec![("Normal".to_string(), "SERVICE_ACCOUNT_CREATED".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_create_emits_warning_and_propagates() {
        let mut store = MockChildStore::new();
        store.expect_exists().returning(|_, _, _| Ok(false));
        store
            .expect_create()
            .returning(|_, _| Err(Error::internal("api down")));
        let events = RecordingPublisher::default();

        let result = ensure_exists(
            &store,
            &events,
            &owner(),
            ChildKind::RoleBinding,
            "wirepact",
            "wirepact-pki",
            || ChildResource::RoleBinding(RoleBinding::default()),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(
            *events.events.lock().unwrap(),
            vec![("Warning".to_string(), "ROLE_BINDING_FAILED".to_string())]
        );
    }

    #[tokio::test]
    async fn owner_without_uid_is_an_error() {
        let mut store = MockChildStore::new();
        store.expect_exists().returning(|_, _, _| Ok(false));
        store.expect_create().never();

        let ca = CertificateAuthority::new("wirepact-pki", CertificateAuthoritySpec::default());
        let result = ensure_exists(
            &store,
            &wirepact_common::events::NoopEventPublisher,
            &ca,
            ChildKind::ServiceAccount,
            "wirepact",
            "wirepact-pki",
            account,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn event_prefixes() {
        assert_eq!(ChildKind::ServiceAccount.event_prefix(), "SERVICE_ACCOUNT");
        assert_eq!(ChildKind::Deployment.to_string(), "Deployment");
        assert_eq!(account().kind(), ChildKind::ServiceAccount);
    }
}
