// Credential resolution: expands declarative references (explicit,
// auto-discovery, bundle) into concrete (collection, group, field) tuples.
// Field listings are cached per (collection, group) for the lifetime of one
// run so repeated references never trigger redundant store calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use crate::api::{BundleConfig, CredentialReference, CredentialSource, ResolvedCredential};
use crate::client::SecretStoreClient;
use crate::errors::OrchestratorError;

/// Fields discovered per (collection, group), shared across all resolution
/// calls of one run.
#[derive(Debug, Default)]
pub struct DiscoveredFieldsCache {
    inner: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl DiscoveredFieldsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, group: &str) -> Option<Vec<String>> {
        self.inner
            .lock()
            .get(&(collection.to_string(), group.to_string()))
            .cloned()
    }

    pub fn insert(&self, collection: &str, group: &str, fields: Vec<String>) {
        self.inner
            .lock()
            .insert((collection.to_string(), group.to_string()), fields);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Resolve a list of credential references to concrete tuples.
///
/// Explicit references pass through unchanged; auto-discovery references are
/// expanded from the (cached) store listing; bundle references are expanded
/// from the bundle configuration with the bundle's mount path re-stamped
/// onto every entry. Resolution stops at the first failing reference: a
/// credential that is not correctly set up must fail the whole test.
pub async fn resolve_credential_references(
    references: &[CredentialReference],
    bundle_config: Option<&BundleConfig>,
    store: Option<&dyn SecretStoreClient>,
    cache: &DiscoveredFieldsCache,
) -> Result<Vec<ResolvedCredential>, OrchestratorError> {
    let mut resolved = Vec::new();
    for reference in references {
        match &reference.source {
            CredentialSource::Explicit {
                collection,
                group,
                field,
                alias,
            } => {
                resolved.push(ResolvedCredential {
                    collection: collection.clone(),
                    group: group.clone(),
                    field: field.clone(),
                    alias: alias.clone(),
                    mount_path: reference.mount_path.clone(),
                });
            }
            CredentialSource::AutoDiscovery { collection, group } => {
                let fields = discover_fields(store, cache, collection, group).await?;
                for field in fields {
                    resolved.push(ResolvedCredential {
                        collection: collection.clone(),
                        group: group.clone(),
                        field,
                        alias: None,
                        mount_path: reference.mount_path.clone(),
                    });
                }
            }
            CredentialSource::Bundle { name } => {
                let config = bundle_config.ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "bundle reference {name:?} requires a bundle config file, but none is loaded"
                    ))
                })?;
                let bundle = config.bundle(name).ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "bundle {name:?} not found in config file"
                    ))
                })?;
                let expanded = expand_bundle(bundle, store, cache)
                    .await
                    .map_err(|e| e.context(format!("failed to expand bundle {name:?}")))?;
                if expanded.is_empty() {
                    return Err(OrchestratorError::Configuration(format!(
                        "bundle {name:?} resolved to no credentials"
                    )));
                }
                for mut credential in expanded {
                    credential.mount_path = reference.mount_path.clone();
                    resolved.push(credential);
                }
            }
        }
    }
    Ok(resolved)
}

/// Expand a bundle definition into individual resolved credentials. Entries
/// without an explicit field list are auto-discovered through the shared
/// cache. Mount paths are left empty for the caller to stamp.
async fn expand_bundle(
    bundle: &crate::api::Bundle,
    store: Option<&dyn SecretStoreClient>,
    cache: &DiscoveredFieldsCache,
) -> Result<Vec<ResolvedCredential>, OrchestratorError> {
    let mut resolved = Vec::new();
    for entry in &bundle.secrets {
        if entry.fields.is_empty() {
            let fields = discover_fields(store, cache, &entry.collection, &entry.group).await?;
            debug!(
                collection = %entry.collection,
                group = %entry.group,
                count = fields.len(),
                "discovered bundle fields"
            );
            for field in fields {
                resolved.push(ResolvedCredential {
                    collection: entry.collection.clone(),
                    group: entry.group.clone(),
                    field,
                    alias: None,
                    mount_path: String::new(),
                });
            }
        } else {
            for field in &entry.fields {
                resolved.push(ResolvedCredential {
                    collection: entry.collection.clone(),
                    group: entry.group.clone(),
                    field: field.name.clone(),
                    alias: field.alias.clone(),
                    mount_path: String::new(),
                });
            }
        }
    }
    Ok(resolved)
}

/// Fetch the field list for a (collection, group), memoizing the result.
async fn discover_fields(
    store: Option<&dyn SecretStoreClient>,
    cache: &DiscoveredFieldsCache,
    collection: &str,
    group: &str,
) -> Result<Vec<String>, OrchestratorError> {
    if let Some(fields) = cache.get(collection, group) {
        return Ok(fields);
    }
    let store = store.ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "auto-discovery for {collection}__{group} requires a secret store client, but none is configured"
        ))
    })?;
    let fields = store.list_fields(collection, group).await.map_err(|e| {
        OrchestratorError::SecretStore(format!(
            "auto-discovery failed for {collection}__{group}: {e}"
        ))
    })?;
    // A reference must never silently resolve to nothing.
    if fields.is_empty() {
        return Err(OrchestratorError::SecretStore(format!(
            "auto-discovery found no fields under {collection}__{group}"
        )));
    }
    cache.insert(collection, group, fields.clone());
    Ok(fields)
}

/// Reject resolved sets where two different groups within one collection
/// target the same mount path: both would try to create files at the same
/// location. Must run after resolution, because auto-discovery and bundle
/// expansion are the only ways such a collision can arise implicitly.
pub fn validate_no_group_collisions_on_mount_path(
    credentials: &[ResolvedCredential],
) -> Result<(), OrchestratorError> {
    let mut groups_per_mount: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
    for credential in credentials {
        groups_per_mount
            .entry((credential.collection.clone(), credential.mount_path.clone()))
            .or_default()
            .insert(credential.group.clone());
    }
    for ((collection, mount_path), groups) in groups_per_mount {
        if groups.len() > 1 {
            let list: Vec<String> = groups.into_iter().collect();
            return Err(OrchestratorError::Configuration(format!(
                "multiple groups ({}) found for collection={collection}, mount_path={mount_path} - \
                 different groups in the same collection must use different mount paths to avoid \
                 file name collisions",
                list.join(", "),
            )));
        }
    }
    Ok(())
}
