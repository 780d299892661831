// Test doubles: an in-memory cluster, a scripted secret store, and a static
// parameter source. Pod completion is scripted per pod name; unscripted pods
// succeed immediately, `hang` pods run until deleted or cancelled, which is
// how long-running observers are simulated.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Pod, PodStatus, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{
    ClusterClient, ClusterError, ParameterError, ParameterSource, PodCompletion,
    SecretStoreClient, SecretStoreError, WaitOptions,
};
use crate::csi::SecretProviderClass;

#[derive(Debug, Clone)]
enum PodScript {
    Fail(String),
    Hang,
}

#[derive(Default)]
struct ClusterState {
    pods: HashMap<(String, String), Pod>,
    created_pods: Vec<String>,
    deleted_pods: Vec<String>,
    scripts: HashMap<String, PodScript>,
    secrets: HashMap<(String, String), Secret>,
    config_maps: HashMap<(String, String), ConfigMap>,
    service_accounts: HashMap<(String, String), ServiceAccount>,
    roles: HashMap<(String, String), Role>,
    role_bindings: HashMap<(String, String), RoleBinding>,
    provider_classes: HashMap<(String, String), SecretProviderClass>,
    namespaces: HashMap<String, Namespace>,
}

/// In-memory stand-in for the cluster API.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn exists_err(kind: &'static str, meta: &ObjectMeta) -> ClusterError {
    let (namespace, name) = key(meta);
    ClusterError::AlreadyExists {
        kind,
        namespace,
        name,
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named pod fail with the given reason once it runs.
    pub fn script_pod_failure(&self, name: &str, reason: &str) {
        self.state
            .lock()
            .scripts
            .insert(name.to_string(), PodScript::Fail(reason.to_string()));
    }

    /// Make the named pod run until it is deleted or the wait is cancelled.
    pub fn script_pod_hang(&self, name: &str) {
        self.state
            .lock()
            .scripts
            .insert(name.to_string(), PodScript::Hang);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Pod names in creation order.
    pub fn created_pod_names(&self) -> Vec<String> {
        self.state.lock().created_pods.clone()
    }

    pub fn deleted_pod_names(&self) -> Vec<String> {
        self.state.lock().deleted_pods.clone()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_secret(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let data: BTreeMap<String, ByteString> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        let secret = Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        };
        self.state
            .lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn put_labeled_secret(&self, namespace: &str, name: &str, label: (&str, &str)) {
        let mut labels = BTreeMap::new();
        labels.insert(label.0.to_string(), label.1.to_string());
        let secret = Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        self.state
            .lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.state
            .lock()
            .roles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.state
            .lock()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn secret_provider_classes(&self, namespace: &str) -> Vec<SecretProviderClass> {
        self.state
            .lock()
            .provider_classes
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, class)| class.clone())
            .collect()
    }

    pub fn put_namespace(&self, name: &str, uid_range: Option<&str>) {
        let annotations = uid_range.map(|range| {
            let mut map = BTreeMap::new();
            map.insert(
                conductor_common::constants::NAMESPACE_UID_RANGE_ANNOTATION.to_string(),
                range.to_string(),
            );
            map
        });
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        self.state
            .lock()
            .namespaces
            .insert(name.to_string(), namespace);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let mut state = self.state.lock();
        let pod_key = key(&pod.metadata);
        if state.pods.contains_key(&pod_key) {
            return Err(exists_err("Pod", &pod.metadata));
        }
        state.created_pods.push(pod_key.1.clone());
        state.pods.insert(pod_key, pod.clone());
        Ok(pod.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pod(namespace, name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let removed = state
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        state.deleted_pods.push(name.to_string());
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace
                    && pod
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(label))
                        .map(|v| v == value)
                        .unwrap_or(false)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn wait_for_pod_deletion(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pod(namespace, name).is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!("deletion of pod {name}")));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        name: &str,
        opts: WaitOptions,
        cancel: &CancellationToken,
    ) -> Result<PodCompletion, ClusterError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }
            let script = self.state.lock().scripts.get(name).cloned();
            match self.pod(namespace, name) {
                None if opts.interruptible => {
                    return Ok(PodCompletion {
                        pod: Pod::default(),
                        failed: false,
                        reason: Some("interrupted".to_string()),
                    });
                }
                None => {
                    return Err(ClusterError::NotFound {
                        kind: "Pod",
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    });
                }
                Some(mut pod) => match script {
                    Some(PodScript::Hang) => {}
                    Some(PodScript::Fail(reason)) => {
                        pod.status = Some(PodStatus {
                            phase: Some("Failed".to_string()),
                            reason: Some(reason.clone()),
                            ..PodStatus::default()
                        });
                        self.state
                            .lock()
                            .pods
                            .insert(key(&pod.metadata), pod.clone());
                        return Ok(PodCompletion {
                            pod,
                            failed: true,
                            reason: Some(reason),
                        });
                    }
                    None => {
                        pod.status = Some(PodStatus {
                            phase: Some("Succeeded".to_string()),
                            ..PodStatus::default()
                        });
                        self.state
                            .lock()
                            .pods
                            .insert(key(&pod.metadata), pod.clone());
                        return Ok(PodCompletion {
                            pod,
                            failed: false,
                            reason: None,
                        });
                    }
                },
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let secret_key = key(&secret.metadata);
        if state.secrets.contains_key(&secret_key) {
            return Err(exists_err("Secret", &secret.metadata));
        }
        state.secrets.insert(secret_key, secret.clone());
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Ok(self.secret(namespace, name))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let removed = self
            .state
            .lock()
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "Secret",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError> {
        let mut secrets: Vec<Secret> = self
            .state
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, secret)| secret.clone())
            .collect();
        secrets.sort_by_key(|s| s.metadata.name.clone());
        Ok(secrets)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let map_key = key(&config_map.metadata);
        if state.config_maps.contains_key(&map_key) {
            return Err(exists_err("ConfigMap", &config_map.metadata));
        }
        state.config_maps.insert(map_key, config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let removed = self
            .state
            .lock()
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "ConfigMap",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let account_key = key(&account.metadata);
        if state.service_accounts.contains_key(&account_key) {
            return Err(exists_err("ServiceAccount", &account.metadata));
        }
        state.service_accounts.insert(account_key, account.clone());
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError> {
        Ok(self.service_account(namespace, name))
    }

    async fn create_role(&self, role: &Role) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let role_key = key(&role.metadata);
        if state.roles.contains_key(&role_key) {
            return Err(exists_err("Role", &role.metadata));
        }
        state.roles.insert(role_key, role.clone());
        Ok(())
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let binding_key = key(&binding.metadata);
        if state.role_bindings.contains_key(&binding_key) {
            return Err(exists_err("RoleBinding", &binding.metadata));
        }
        state.role_bindings.insert(binding_key, binding.clone());
        Ok(())
    }

    async fn create_secret_provider_class(
        &self,
        class: &SecretProviderClass,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let class_key = key(&class.metadata);
        if state.provider_classes.contains_key(&class_key) {
            return Err(exists_err("SecretProviderClass", &class.metadata));
        }
        state.provider_classes.insert(class_key, class.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        Ok(self.state.lock().namespaces.get(name).cloned())
    }
}

/// Scripted secret-store fields with a listing-call counter.
#[derive(Default)]
pub struct FakeSecretStore {
    fields: Mutex<HashMap<(String, String), Vec<String>>>,
    calls: Mutex<usize>,
}

impl FakeSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fields(&self, collection: &str, group: &str, fields: Vec<&str>) {
        self.fields.lock().insert(
            (collection.to_string(), group.to_string()),
            fields.into_iter().map(String::from).collect(),
        );
    }

    pub fn list_calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl SecretStoreClient for FakeSecretStore {
    async fn list_fields(
        &self,
        collection: &str,
        group: &str,
    ) -> Result<Vec<String>, SecretStoreError> {
        *self.calls.lock() += 1;
        self.fields
            .lock()
            .get(&(collection.to_string(), group.to_string()))
            .cloned()
            .ok_or_else(|| {
                SecretStoreError(format!("no secrets under {collection}__{group}"))
            })
    }
}

/// Fixed parameter values for tests.
#[derive(Default)]
pub struct StaticParams {
    values: HashMap<String, String>,
}

impl StaticParams {
    pub fn with<const N: usize>(entries: [(&str, &str); N]) -> Self {
        StaticParams {
            values: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ParameterSource for StaticParams {
    fn get(&self, name: &str) -> Result<String, ParameterError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ParameterError(name.to_string()))
    }
}
