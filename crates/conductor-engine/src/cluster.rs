// Kubernetes-backed implementation of the cluster client, built on kube-rs.
// Waits use `await_condition` from the kube runtime, bounded by the caller's
// timeout and cancellation token.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;

use crate::client::{ClusterClient, ClusterError, PodCompletion, WaitOptions};
use crate::csi::SecretProviderClass;

/// A `ClusterClient` talking to a real cluster.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        KubeClusterClient { client }
    }

    /// Build a client from the ambient configuration: in-cluster when
    /// running in a pod, otherwise the local kubeconfig.
    pub async fn from_default_env() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("failed to build cluster client: {e}")))?;
        Ok(KubeClusterClient { client })
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_err(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ref response) if response.code == 409 => ClusterError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => ClusterError::Api(other.to_string()),
    }
}

fn pod_is_terminal(pod: Option<&Pod>) -> bool {
    match pod {
        // a deleted pod ends the wait; the caller decides what it means
        None => true,
        Some(pod) => pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Succeeded" || phase == "Failed"),
    }
}

async fn create<K>(api: &Api<K>, object: &K, kind: &'static str) -> Result<(), ClusterError>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let namespace = object.meta().namespace.clone().unwrap_or_default();
    let name = object.meta().name.clone().unwrap_or_default();
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| map_kube_err(kind, &namespace, &name, e))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.namespaced::<Pod>(&namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| map_kube_err("Pod", &namespace, &name, e))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.namespaced::<Pod>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("Pod", namespace, name, e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.namespaced::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("Pod", namespace, name, e))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .namespaced::<Pod>(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_err("Pod", namespace, "", e))?;
        Ok(list.items)
    }

    async fn wait_for_pod_deletion(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let api = self.namespaced::<Pod>(namespace);
        let gone = await_condition(api, name, |pod: Option<&Pod>| pod.is_none());
        tokio::time::timeout(timeout, gone)
            .await
            .map_err(|_| ClusterError::Timeout(format!("deletion of pod {name}")))?
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(())
    }

    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        name: &str,
        opts: WaitOptions,
        cancel: &CancellationToken,
    ) -> Result<PodCompletion, ClusterError> {
        let api = self.namespaced::<Pod>(namespace);
        let wait = await_condition(api, name, pod_is_terminal);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
            outcome = async {
                match opts.timeout {
                    Some(limit) => tokio::time::timeout(limit, wait)
                        .await
                        .map_err(|_| ClusterError::Timeout(format!("completion of pod {name}")))?,
                    None => wait.await,
                }
                .map_err(|e| ClusterError::Api(e.to_string()))
            } => outcome?,
        };
        match outcome {
            Some(pod) => {
                let status = pod.status.clone();
                let failed = status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Failed");
                let reason = status.and_then(|s| s.reason);
                Ok(PodCompletion {
                    pod,
                    failed,
                    reason,
                })
            }
            None if opts.interruptible => Ok(PodCompletion {
                pod: Pod::default(),
                failed: false,
                reason: Some("interrupted".to_string()),
            }),
            None => Err(ClusterError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        create(&self.namespaced::<Secret>(&namespace), secret, "Secret").await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        self.namespaced::<Secret>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("Secret", namespace, name, e))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.namespaced::<Secret>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("Secret", namespace, name, e))
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError> {
        let list = self
            .namespaced::<Secret>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err("Secret", namespace, "", e))?;
        Ok(list.items)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError> {
        let namespace = config_map.metadata.namespace.clone().unwrap_or_default();
        create(&self.namespaced::<ConfigMap>(&namespace), config_map, "ConfigMap").await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.namespaced::<ConfigMap>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("ConfigMap", namespace, name, e))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ClusterError> {
        let namespace = account.metadata.namespace.clone().unwrap_or_default();
        create(
            &self.namespaced::<ServiceAccount>(&namespace),
            account,
            "ServiceAccount",
        )
        .await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError> {
        self.namespaced::<ServiceAccount>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("ServiceAccount", namespace, name, e))
    }

    async fn create_role(&self, role: &Role) -> Result<(), ClusterError> {
        let namespace = role.metadata.namespace.clone().unwrap_or_default();
        create(&self.namespaced::<Role>(&namespace), role, "Role").await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError> {
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        create(
            &self.namespaced::<RoleBinding>(&namespace),
            binding,
            "RoleBinding",
        )
        .await
    }

    async fn create_secret_provider_class(
        &self,
        class: &SecretProviderClass,
    ) -> Result<(), ClusterError> {
        let namespace = class.metadata.namespace.clone().unwrap_or_default();
        create(
            &self.namespaced::<SecretProviderClass>(&namespace),
            class,
            "SecretProviderClass",
        )
        .await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(|e| map_kube_err("Namespace", "", name, e))
    }
}
