//! Shared Kubernetes utilities using kube-rs
//!
//! Thin wrappers over `Api<K>` that the controllers and the admission webhook
//! share: optional lookups, status and finalizer patches, and the content
//! fingerprint used to detect configuration changes.

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Returns true when the kube error is an API 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Get an object by name, mapping 404 to `None`.
pub async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether an object with the given name exists.
pub async fn exists<K>(api: &Api<K>, name: &str) -> Result<bool, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(get_optional(api, name).await?.is_some())
}

/// Create an object.
pub async fn create<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj).await
}

/// Replace an object.
///
/// The object's `resourceVersion` is sent along, so a concurrent write makes
/// the API server answer 409 instead of silently losing an update.
pub async fn replace<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj)
        .await
}

/// Patch the status sub-resource of a resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. The caller picks namespaced or cluster scope through `api`.
pub async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    status: &impl Serialize,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Check whether a resource carries the given finalizer.
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add a finalizer to a resource, doing nothing if already present.
pub async fn add_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let obj = api.get(name).await?;
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, name, finalizers, field_manager).await
}

/// Remove a finalizer from a resource.
///
/// A resource that is already gone counts as success.
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(obj) = get_optional(api, name).await? else {
        return Ok(());
    };
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    if finalizers.len() == obj.finalizers().len() {
        return Ok(());
    }
    match patch_finalizers(api, name, finalizers, field_manager).await {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    name: &str,
    finalizers: Vec<String>,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Compute the SHA-256 fingerprint of `content` as lowercase hex.
///
/// Used to stamp rendered configuration into pod templates so that a content
/// change rolls the pods.
pub fn content_fingerprint(content: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, content);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
