// One-shot, idempotent setup performed before any step runs: the shared-state
// secret, credential delivery objects (provider classes or copied secrets),
// the command script config map, and the RBAC the step pods execute under.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use conductor_common::constants::{MULTI_STAGE_TEST_LABEL, SKIP_CENSORING_LABEL};

use crate::api::{ResolvedCredential, SecretStoreSettings, TestConfiguration};
use crate::client::ClusterClient;
use crate::csi;
use crate::errors::OrchestratorError;

/// Cluster role granting the device and network access a VPN client needs.
pub const VPN_CLUSTER_ROLE: &str = "conductor-vpn";

/// How long to wait for the token controller to populate the new service
/// account before giving up.
const SERVICE_ACCOUNT_WAIT: Duration = Duration::from_secs(60);
const SERVICE_ACCOUNT_POLL: Duration = Duration::from_secs(1);

fn tolerate_exists(result: Result<(), crate::client::ClusterError>) -> Result<(), OrchestratorError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_already_exists() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn tolerate_missing(result: Result<(), crate::client::ClusterError>) -> Result<(), OrchestratorError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Recreate the shared-state secret steps exchange data through. The delete
/// tolerates absence, so recreation over a leftover run is idempotent.
pub async fn create_shared_dir_secret(
    client: &dyn ClusterClient,
    config: &TestConfiguration,
) -> Result<(), OrchestratorError> {
    debug!("Creating multi-stage test shared directory {:?}", config.name);
    let mut labels = BTreeMap::new();
    labels.insert(SKIP_CENSORING_LABEL.to_string(), "true".to_string());
    let secret = Secret {
        metadata: ObjectMeta {
            namespace: Some(config.namespace.clone()),
            name: Some(config.name.clone()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    };
    tolerate_missing(client.delete_secret(&config.namespace, &config.name).await)
        .map_err(|e| e.context(format!("cannot delete shared directory {:?}", config.name)))?;
    client.create_secret(&secret).await?;
    Ok(())
}

/// Copy each referenced credential secret from its source namespace into the
/// test namespace. Used when CSI delivery is disabled.
pub async fn copy_credential_secrets(
    client: &dyn ClusterClient,
    config: &TestConfiguration,
    resolved: &[ResolvedCredential],
) -> Result<(), OrchestratorError> {
    debug!("Creating multi-stage test credentials for {:?}", config.name);
    let mut seen = HashSet::new();
    for credential in resolved {
        if !seen.insert((credential.collection.clone(), credential.group.clone())) {
            continue;
        }
        // Prefixing with the source collection keeps names recognizable for
        // debugging while avoiding collisions between collections.
        let name = format!("{}-{}", credential.collection, credential.group);
        let source = client
            .get_secret(&credential.collection, &credential.group)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "could not read source credential {}/{}",
                    credential.collection, credential.group
                ))
            })?;
        let copy = Secret {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(config.namespace.clone()),
                ..ObjectMeta::default()
            },
            type_: source.type_.clone(),
            data: source.data.clone(),
            string_data: source.string_data.clone(),
            ..Secret::default()
        };
        tolerate_exists(client.create_secret(&copy).await)
            .map_err(|e| e.context("could not create source credential"))?;
    }
    Ok(())
}

/// Create the provider classes the CSI driver materializes secrets from: one
/// per distinct (collection, group, mount path) group of resolved
/// credentials, plus one per (collection, group) for the censoring mounts.
/// Classes that already exist are left in place.
pub async fn create_secret_provider_classes(
    client: &dyn ClusterClient,
    config: &TestConfiguration,
    resolved: &[ResolvedCredential],
    settings: &SecretStoreSettings,
) -> Result<(), OrchestratorError> {
    let mut groups: Vec<Vec<ResolvedCredential>> =
        csi::group_credentials(resolved).into_values().collect();
    groups.extend(csi::censor_credential_groups(resolved).into_values());

    let mut created = HashSet::new();
    for group in groups {
        let name = csi::provider_class_name(&config.namespace, &group);
        if !created.insert(name.clone()) {
            continue;
        }
        let secrets = csi::secrets_parameter(settings, &group)?;
        let class = csi::build_provider_class(&name, &config.namespace, secrets);
        tolerate_exists(client.create_secret_provider_class(&class).await)
            .map_err(|e| e.context("could not create SecretProviderClass object for secret"))?;
    }
    Ok(())
}

/// Create the immutable config map mapping step name to raw command text.
/// Immutable objects cannot be updated, so recreation goes through delete.
pub async fn create_command_config_map(
    client: &dyn ClusterClient,
    config: &TestConfiguration,
) -> Result<(), OrchestratorError> {
    debug!("Creating multi-stage test commands configmap for {:?}", config.name);
    let data: BTreeMap<String, String> = config
        .all_steps()
        .map(|step| (step.name.clone(), step.commands.clone()))
        .collect();
    let name = config.commands_config_map_name();
    let commands = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.namespace.clone()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        immutable: Some(true),
        ..ConfigMap::default()
    };
    tolerate_missing(client.delete_config_map(&config.namespace, &name).await)
        .map_err(|e| e.context(format!("could not delete command configmap {name}")))?;
    client
        .create_config_map(&commands)
        .await
        .map_err(|e| OrchestratorError::from(e).context(format!("could not create command configmap {name}")))?;
    Ok(())
}

/// Create the service account, role, and bindings the step pods run under.
/// The role is scoped to the shared-state secret, imagestream-layer reads,
/// and role/rolebinding creation for nested privilege delegation.
pub async fn setup_rbac(
    client: &dyn ClusterClient,
    config: &TestConfiguration,
    vpn_enabled: bool,
) -> Result<(), OrchestratorError> {
    let mut labels = BTreeMap::new();
    labels.insert(MULTI_STAGE_TEST_LABEL.to_string(), config.name.clone());
    let meta = ObjectMeta {
        namespace: Some(config.namespace.clone()),
        name: Some(config.name.clone()),
        labels: Some(labels.clone()),
        ..ObjectMeta::default()
    };

    let account = ServiceAccount {
        metadata: meta.clone(),
        image_pull_secrets: config
            .registry_pull_secret
            .as_ref()
            .map(|name| vec![LocalObjectReference { name: name.clone() }]),
        ..ServiceAccount::default()
    };
    let role = Role {
        metadata: meta.clone(),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["rbac.authorization.k8s.io".to_string()]),
                resources: Some(vec!["rolebindings".to_string(), "roles".to_string()]),
                verbs: vec!["create".to_string(), "list".to_string()],
                ..PolicyRule::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["secrets".to_string()]),
                resource_names: Some(vec![config.name.clone()]),
                verbs: vec!["get".to_string(), "update".to_string()],
                ..PolicyRule::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new(), "image.openshift.io".to_string()]),
                resources: Some(vec!["imagestreams/layers".to_string()]),
                verbs: vec!["get".to_string()],
                ..PolicyRule::default()
            },
        ]),
    };
    let subjects = vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: config.name.clone(),
        ..Subject::default()
    }];
    let mut bindings = vec![
        RoleBinding {
            metadata: meta.clone(),
            role_ref: RoleRef {
                kind: "Role".to_string(),
                name: config.name.clone(),
                ..RoleRef::default()
            },
            subjects: Some(subjects.clone()),
        },
        RoleBinding {
            metadata: ObjectMeta {
                namespace: Some(config.namespace.clone()),
                name: Some(format!("{}-view", config.name)),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                kind: "ClusterRole".to_string(),
                name: "view".to_string(),
                ..RoleRef::default()
            },
            subjects: Some(subjects.clone()),
        },
    ];
    if vpn_enabled {
        bindings.push(RoleBinding {
            metadata: ObjectMeta {
                namespace: Some(config.namespace.clone()),
                name: Some(format!("{}-vpn", config.name)),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                kind: "ClusterRole".to_string(),
                name: VPN_CLUSTER_ROLE.to_string(),
                ..RoleRef::default()
            },
            subjects: Some(subjects),
        });
    }

    tolerate_exists(client.create_service_account(&account).await)?;
    tolerate_exists(client.create_role(&role).await)?;
    for binding in &bindings {
        tolerate_exists(client.create_role_binding(binding).await)?;
    }

    // The pods cannot start until the account exists server-side; confirm it
    // with a bounded poll.
    let deadline = tokio::time::Instant::now() + SERVICE_ACCOUNT_WAIT;
    loop {
        if client
            .get_service_account(&config.namespace, &config.name)
            .await?
            .is_some()
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OrchestratorError::Cluster(
                crate::client::ClusterError::Timeout(format!(
                    "service account {}/{}",
                    config.namespace, config.name
                )),
            ));
        }
        tokio::time::sleep(SERVICE_ACCOUNT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StepDefinition;
    use crate::testing::FakeCluster;
    use std::sync::Arc;

    fn config() -> TestConfiguration {
        TestConfiguration {
            name: "e2e".to_string(),
            namespace: "ci-op-1234".to_string(),
            job_name: "job".to_string(),
            registry_pull_secret: Some("registry-pull-credentials".to_string()),
            pre: vec![StepDefinition {
                name: "install".to_string(),
                from: Some("cli".to_string()),
                from_image: None,
                commands: "install.sh".to_string(),
                run_as_script: true,
                resources: Default::default(),
                env: Vec::new(),
                dependencies: Vec::new(),
                credentials: Vec::new(),
                dns: None,
                cli: None,
                timeout_seconds: None,
                grace_period_seconds: None,
                best_effort: false,
                optional_on_success: false,
                node_architecture: None,
            }],
            ..TestConfiguration::default()
        }
    }

    fn credential(group: &str, field: &str) -> ResolvedCredential {
        ResolvedCredential {
            collection: "team".to_string(),
            group: group.to_string(),
            field: field.to_string(),
            alias: None,
            mount_path: format!("/secrets/{group}"),
        }
    }

    #[tokio::test]
    async fn test_shared_dir_secret_is_recreated_idempotently() {
        let cluster = Arc::new(FakeCluster::new());
        let config = config();
        create_shared_dir_secret(cluster.as_ref(), &config).await.unwrap();
        assert!(cluster.secret("ci-op-1234", "e2e").is_some());
        // a second provisioning pass produces the same end state
        create_shared_dir_secret(cluster.as_ref(), &config).await.unwrap();
        let secret = cluster.secret("ci-op-1234", "e2e").unwrap();
        assert_eq!(
            secret.metadata.labels.unwrap()[SKIP_CENSORING_LABEL],
            "true"
        );
    }

    #[tokio::test]
    async fn test_command_config_map_is_immutable_and_recreated() {
        let cluster = Arc::new(FakeCluster::new());
        let config = config();
        create_command_config_map(cluster.as_ref(), &config).await.unwrap();
        create_command_config_map(cluster.as_ref(), &config).await.unwrap();
        let map = cluster.config_map("ci-op-1234", "e2e-commands").unwrap();
        assert_eq!(map.immutable, Some(true));
        assert_eq!(map.data.unwrap()["install"], "install.sh");
    }

    #[tokio::test]
    async fn test_rbac_setup_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new());
        let config = config();
        setup_rbac(cluster.as_ref(), &config, false).await.unwrap();
        setup_rbac(cluster.as_ref(), &config, true).await.unwrap();

        let account = cluster.service_account("ci-op-1234", "e2e").unwrap();
        assert_eq!(
            account.image_pull_secrets.unwrap()[0].name,
            "registry-pull-credentials"
        );
        let role = cluster.role("ci-op-1234", "e2e").unwrap();
        let rules = role.rules.unwrap();
        assert!(rules
            .iter()
            .any(|r| r.resource_names.as_deref() == Some(&["e2e".to_string()])));
        assert!(cluster.role_binding("ci-op-1234", "e2e").is_some());
        assert!(cluster.role_binding("ci-op-1234", "e2e-view").is_some());
        assert!(cluster.role_binding("ci-op-1234", "e2e-vpn").is_some());
    }

    #[tokio::test]
    async fn test_copy_credential_secrets_deduplicates_groups() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_secret("team", "aws", &[("access-key", "AKIA")]);
        let config = config();
        let resolved = vec![credential("aws", "access-key"), credential("aws", "secret-key")];
        copy_credential_secrets(cluster.as_ref(), &config, &resolved).await.unwrap();
        assert!(cluster.secret("ci-op-1234", "team-aws").is_some());
        // idempotent on rerun
        copy_credential_secrets(cluster.as_ref(), &config, &resolved).await.unwrap();

        let missing = vec![credential("gcp", "sa.json")];
        let err = copy_credential_secrets(cluster.as_ref(), &config, &missing)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not read source credential"));
    }

    #[tokio::test]
    async fn test_provider_classes_cover_mounts_and_censoring() {
        let cluster = Arc::new(FakeCluster::new());
        let config = config();
        let resolved = vec![credential("aws", "access-key"), credential("aws", "secret-key")];
        create_secret_provider_classes(
            cluster.as_ref(),
            &config,
            &resolved,
            &SecretStoreSettings::default(),
        )
        .await
        .unwrap();
        // one class for the step mount group, one for the censoring mount
        assert_eq!(cluster.secret_provider_classes("ci-op-1234").len(), 2);

        // idempotent on rerun
        create_secret_provider_classes(
            cluster.as_ref(),
            &config,
            &resolved,
            &SecretStoreSettings::default(),
        )
        .await
        .unwrap();
        assert_eq!(cluster.secret_provider_classes("ci-op-1234").len(), 2);
    }
}
