//! Shared Kubernetes utilities using kube-rs

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;

/// Kubernetes limits CronJob names to 52 characters
pub const MAX_CRON_JOB_NAME_LEN: usize = 52;

/// Split an apiVersion into (group, version)
///
/// Core resources have no group: `"v1"` becomes `("", "v1")`.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource for a kind with a known apiVersion
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Kinds whose plural is not derivable by the fallback rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("repository", "repositories"),
    ("backupbatch", "backupbatches"),
    ("networkpolicy", "networkpolicies"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Name for a generated resource: `<prefix>-<name>` cut to `max_len`
///
/// Dashes left dangling by the cut are trimmed.
pub fn valid_name_with_prefix(prefix: &str, name: &str, max_len: usize) -> String {
    let full = format!("{}-{}", prefix, name);
    let cut: String = full.chars().take(max_len).collect();
    cut.trim_matches('-').to_string()
}

/// Insert or update an owner reference, matched by UID
///
/// Returns true if `owners` changed.
pub fn ensure_owner_reference(owners: &mut Vec<OwnerReference>, owner: &OwnerReference) -> bool {
    match owners.iter_mut().find(|o| o.uid == owner.uid) {
        Some(existing) if existing == owner => false,
        Some(existing) => {
            *existing = owner.clone();
            true
        }
        None => {
            owners.push(owner.clone());
            true
        }
    }
}

/// Whether `meta` lists an owner with the given UID
pub fn has_owner(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.uid == uid))
}

/// Merge `upsert` into `base`, values from `upsert` winning
pub fn upsert_map(
    base: Option<&BTreeMap<String, String>>,
    upsert: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.cloned().unwrap_or_default();
    for (k, v) in upsert {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Whether `meta` carries the finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
