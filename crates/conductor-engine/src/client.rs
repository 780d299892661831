// Collaborator interfaces the engine consumes: the typed cluster API client,
// the secret-store listing client, and the upstream parameter provider.
// `RecordingClient` wraps a cluster client and tracks every object written
// through it, so per-step records can report what a step touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::csi::SecretProviderClass;

/// Errors surfaced by a cluster client implementation.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("wait cancelled")]
    Cancelled,

    #[error("cluster API request failed: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// How to wait for a pod to reach a terminal state.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitOptions {
    /// Treat deletion of the pod as a normal way for the wait to end
    /// instead of an error. Used for observers, which are torn down by
    /// deleting their pods.
    pub interruptible: bool,
    /// Upper bound on the wait. `None` defers to the pod's own
    /// `active_deadline_seconds`.
    pub timeout: Option<Duration>,
}

/// Terminal state of a pod the client waited on.
#[derive(Debug, Clone)]
pub struct PodCompletion {
    /// The pod as last observed.
    pub pod: Pod,
    pub failed: bool,
    /// Failure reason reported by the cluster, e.g. `DeadlineExceeded`.
    pub reason: Option<String>,
}

/// Typed access to the cluster objects the engine manages.
///
/// List operations honor label selectors; waits are bounded by the supplied
/// options or the caller's cancellation token.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError>;
    async fn wait_for_pod_deletion(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;
    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        name: &str,
        opts: WaitOptions,
        cancel: &CancellationToken,
    ) -> Result<PodCompletion, ClusterError>;

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError>;
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, ClusterError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ClusterError>;
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError>;
    async fn create_role(&self, role: &Role) -> Result<(), ClusterError>;
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError>;

    async fn create_secret_provider_class(
        &self,
        class: &SecretProviderClass,
    ) -> Result<(), ClusterError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError>;
}

/// A field-listing view of the secret store, used only by auto-discovery.
#[async_trait]
pub trait SecretStoreClient: Send + Sync {
    /// List the field names stored under a (collection, group) pair.
    async fn list_fields(
        &self,
        collection: &str,
        group: &str,
    ) -> Result<Vec<String>, SecretStoreError>;
}

/// A secret-store request failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SecretStoreError(pub String);

/// Read access to variables produced upstream of this test (lease
/// identifiers, release and dependency image pull specs).
pub trait ParameterSource: Send + Sync {
    /// Look up a declared parameter. Fails if the name is undeclared.
    fn get(&self, name: &str) -> Result<String, ParameterError>;
}

/// Lookup failure for an undeclared or unreadable parameter.
#[derive(Debug, Error)]
#[error("no parameter {0} is declared")]
pub struct ParameterError(pub String);

/// Reference to an object written through a recording client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

fn object_ref(
    kind: &'static str,
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> ObjectRef {
    ObjectRef {
        kind,
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
    }
}

/// Wraps a cluster client and records every object written through it.
///
/// The engine keeps one long-lived recorder for the whole run and layers a
/// fresh one on top of it per step, so each step's record lists exactly the
/// objects that step wrote while the run-wide recorder still sees everything.
pub struct RecordingClient {
    inner: Arc<dyn ClusterClient>,
    objects: Mutex<Vec<ObjectRef>>,
}

impl RecordingClient {
    pub fn new(inner: Arc<dyn ClusterClient>) -> Self {
        RecordingClient {
            inner,
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Objects written through this client, in write order.
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.objects.lock().clone()
    }

    fn record(&self, object: ObjectRef) {
        self.objects.lock().push(object);
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let created = self.inner.create_pod(pod).await?;
        self.record(object_ref("Pod", &created.metadata));
        Ok(created)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.inner.get_pod(namespace, name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.inner.delete_pod(namespace, name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.inner.list_pods(namespace, label_selector).await
    }

    async fn wait_for_pod_deletion(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.inner.wait_for_pod_deletion(namespace, name, timeout).await
    }

    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        name: &str,
        opts: WaitOptions,
        cancel: &CancellationToken,
    ) -> Result<PodCompletion, ClusterError> {
        self.inner
            .wait_for_pod_completion(namespace, name, opts, cancel)
            .await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        self.inner.create_secret(secret).await?;
        self.record(object_ref("Secret", &secret.metadata));
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        self.inner.get_secret(namespace, name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.inner.delete_secret(namespace, name).await
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError> {
        self.inner.list_secrets(namespace).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError> {
        self.inner.create_config_map(config_map).await?;
        self.record(object_ref("ConfigMap", &config_map.metadata));
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.inner.delete_config_map(namespace, name).await
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), ClusterError> {
        self.inner.create_service_account(account).await?;
        self.record(object_ref("ServiceAccount", &account.metadata));
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClusterError> {
        self.inner.get_service_account(namespace, name).await
    }

    async fn create_role(&self, role: &Role) -> Result<(), ClusterError> {
        self.inner.create_role(role).await?;
        self.record(object_ref("Role", &role.metadata));
        Ok(())
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError> {
        self.inner.create_role_binding(binding).await?;
        self.record(object_ref("RoleBinding", &binding.metadata));
        Ok(())
    }

    async fn create_secret_provider_class(
        &self,
        class: &SecretProviderClass,
    ) -> Result<(), ClusterError> {
        self.inner.create_secret_provider_class(class).await?;
        self.record(object_ref("SecretProviderClass", &class.metadata));
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        self.inner.get_namespace(name).await
    }
}
