// Secret delivery through the secrets-store CSI driver: the
// SecretProviderClass resource, deterministic names for classes and volumes,
// and the provider parameter payload listing the store secrets to mount.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use conductor_common::constants::KUBERNETES_DNS_LABEL_LIMIT;

use crate::api::{ResolvedCredential, SecretStoreSettings};
use crate::errors::OrchestratorError;

/// CSI driver name the generated volumes reference.
pub const CSI_DRIVER_NAME: &str = "secrets-store.csi.k8s.io";

/// Store provider the classes delegate to.
pub const CSI_PROVIDER: &str = "gcp";

/// Tells Kubernetes which secrets a CSI volume should materialize.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "secrets-store.csi.x-k8s.io",
    version = "v1",
    kind = "SecretProviderClass",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassSpec {
    pub provider: String,
    pub parameters: BTreeMap<String, String>,
}

/// One entry of the provider's `secrets` parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSecret {
    resource_name: String,
    file_name: String,
}

/// Store-side name of one secret, `collection__group__field`.
pub fn store_secret_name(collection: &str, group: &str, field: &str) -> String {
    format!("{collection}__{group}__{field}")
}

/// Group resolved credentials by (collection, group, mount path). Each group
/// becomes one provider class and one CSI volume, avoiding duplicate mounts.
pub fn group_credentials(
    credentials: &[ResolvedCredential],
) -> BTreeMap<(String, String, String), Vec<ResolvedCredential>> {
    let mut groups: BTreeMap<(String, String, String), Vec<ResolvedCredential>> = BTreeMap::new();
    for credential in credentials {
        groups
            .entry((
                credential.collection.clone(),
                credential.group.clone(),
                credential.mount_path.clone(),
            ))
            .or_default()
            .push(credential.clone());
    }
    groups
}

/// Deterministic provider class name for a credential group. The hash covers
/// collection, group, mount path, and the sorted field names, so two tests
/// that mount the same fields at the same path share one class.
pub fn provider_class_name(namespace: &str, credentials: &[ResolvedCredential]) -> String {
    let Some(first) = credentials.first() else {
        return format!("{namespace}-empty-spc").to_lowercase();
    };
    let mut parts = vec![
        first.collection.clone(),
        first.group.clone(),
        first.mount_path.clone(),
    ];
    let mut fields: Vec<String> = credentials.iter().map(|c| c.field.clone()).collect();
    fields.sort();
    parts.extend(fields);

    let digest = Sha256::digest(parts.join("-").as_bytes());
    let hash = hex::encode(&digest[..12]);
    format!("{namespace}-{hash}-spc").to_lowercase()
}

/// Deterministic, DNS-compliant CSI volume name for a credential group.
/// Falls back to the bare hash when `namespace-hash` exceeds the DNS label
/// limit.
pub fn csi_volume_name(namespace: &str, credentials: &[ResolvedCredential]) -> String {
    let Some(first) = credentials.first() else {
        return format!("{namespace}-empty-vol").to_lowercase();
    };
    let key = [
        first.collection.as_str(),
        first.group.as_str(),
        first.mount_path.as_str(),
    ]
    .join("-");
    let digest = Sha256::digest(key.as_bytes());
    let mut name = format!("{namespace}-{}", hex::encode(&digest[..8]));
    if name.len() > KUBERNETES_DNS_LABEL_LIMIT {
        name = hex::encode(&digest[..16]);
    }
    name.to_lowercase()
}

/// Mount path of a credential's censoring copy in the log-upload sidecar.
pub fn censor_mount_path(group: &str) -> String {
    format!("/censor/{group}")
}

/// Group resolved credentials by (collection, group) with the mount path
/// re-stamped to the censoring location. Provisioning and the censoring
/// volume builder both derive provider class names from these groups, so
/// the names agree by construction.
pub fn censor_credential_groups(
    credentials: &[ResolvedCredential],
) -> BTreeMap<(String, String), Vec<ResolvedCredential>> {
    let mut groups: BTreeMap<(String, String), Vec<ResolvedCredential>> = BTreeMap::new();
    for credential in credentials {
        let mut stamped = credential.clone();
        stamped.mount_path = censor_mount_path(&credential.group);
        groups
            .entry((credential.collection.clone(), credential.group.clone()))
            .or_default()
            .push(stamped);
    }
    groups
}

/// Build the provider `secrets` parameter for a credential group: one store
/// resource per field, mounted under the field's (possibly aliased) name.
pub fn secrets_parameter(
    settings: &SecretStoreSettings,
    credentials: &[ResolvedCredential],
) -> Result<String, OrchestratorError> {
    let mut secrets = Vec::with_capacity(credentials.len());
    for credential in credentials {
        let file_name = restore_forbidden_symbols(credential.mount_name())?;
        secrets.push(StoreSecret {
            resource_name: format!(
                "projects/{}/secrets/{}/versions/latest",
                settings.project,
                store_secret_name(&credential.collection, &credential.group, &credential.field),
            ),
            file_name,
        });
    }
    serde_yaml::to_string(&secrets)
        .map_err(|e| OrchestratorError::Configuration(format!("could not marshal secrets: {e}")))
}

/// Restore symbols the store forbids in secret names, e.g. `--dot--awscreds`
/// back to `.awscreds`, and reject names that still decode to forbidden
/// characters.
pub fn restore_forbidden_symbols(name: &str) -> Result<String, OrchestratorError> {
    let restored = name.replace("--dot--", ".").replace("--slash--", "/");
    let invalid: Vec<char> = restored
        .chars()
        .filter(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '/')))
        .collect();
    if invalid.is_empty() {
        Ok(restored)
    } else {
        Err(OrchestratorError::Configuration(format!(
            "secret name '{name}' decodes to '{restored}' which contains forbidden characters ({})",
            invalid.iter().collect::<String>(),
        )))
    }
}

/// Build a provider class for a credential group.
pub fn build_provider_class(
    name: &str,
    namespace: &str,
    secrets: String,
) -> SecretProviderClass {
    let mut parameters = BTreeMap::new();
    parameters.insert("auth".to_string(), "provider-adc".to_string());
    parameters.insert("secrets".to_string(), secrets);
    let mut class = SecretProviderClass::new(
        name,
        SecretProviderClassSpec {
            provider: CSI_PROVIDER.to_string(),
            parameters,
        },
    );
    class.metadata.namespace = Some(namespace.to_string());
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(collection: &str, group: &str, field: &str, mount_path: &str) -> ResolvedCredential {
        ResolvedCredential {
            collection: collection.to_string(),
            group: group.to_string(),
            field: field.to_string(),
            alias: None,
            mount_path: mount_path.to_string(),
        }
    }

    #[test]
    fn test_group_credentials_by_collection_group_and_mount_path() {
        let groups = group_credentials(&[
            credential("team", "aws", "access-key", "/secrets/aws"),
            credential("team", "aws", "secret-key", "/secrets/aws"),
            credential("team", "gcp", "sa.json", "/secrets/gcp"),
        ]);
        assert_eq!(groups.len(), 2);
        let aws_key = ("team".to_string(), "aws".to_string(), "/secrets/aws".to_string());
        assert_eq!(groups[&aws_key].len(), 2);
    }

    #[test]
    fn test_provider_class_name_is_deterministic_and_field_sensitive() {
        let creds = vec![
            credential("team", "aws", "access-key", "/secrets/aws"),
            credential("team", "aws", "secret-key", "/secrets/aws"),
        ];
        let reordered = vec![creds[1].clone(), creds[0].clone()];
        assert_eq!(provider_class_name("ci-op-1234", &creds), provider_class_name("ci-op-1234", &reordered));

        let fewer = vec![creds[0].clone()];
        assert_ne!(provider_class_name("ci-op-1234", &creds), provider_class_name("ci-op-1234", &fewer));
        assert!(provider_class_name("ci-op-1234", &creds).ends_with("-spc"));
    }

    #[test]
    fn test_csi_volume_name_respects_dns_limit() {
        let creds = vec![credential("team", "aws", "access-key", "/secrets/aws")];
        let short = csi_volume_name("ci-op-1234", &creds);
        assert!(short.starts_with("ci-op-1234-"));
        assert!(short.len() <= KUBERNETES_DNS_LABEL_LIMIT);

        let long_ns = "a".repeat(60);
        let long = csi_volume_name(&long_ns, &creds);
        assert!(!long.starts_with(&long_ns));
        assert!(long.len() <= KUBERNETES_DNS_LABEL_LIMIT);
    }

    #[test]
    fn test_secrets_parameter_uses_alias_and_store_name() {
        let mut cred = credential("team", "aws", "access-key", "/secrets/aws");
        cred.alias = Some("key".to_string());
        let yaml = secrets_parameter(&SecretStoreSettings::default(), &[cred]).unwrap();
        assert!(yaml.contains("projects/conductor-ci-secrets/secrets/team__aws__access-key/versions/latest"));
        assert!(yaml.contains("fileName: key"));
    }

    #[test]
    fn test_restore_forbidden_symbols() {
        assert_eq!(restore_forbidden_symbols("--dot--awscreds").unwrap(), ".awscreds");
        assert_eq!(restore_forbidden_symbols("plain-name").unwrap(), "plain-name");
        assert!(restore_forbidden_symbols("bad name").is_err());
    }
}
