// Data model for multi-stage tests: step definitions, observers, credential
// references, and the run-scoped state records the executor accumulates.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use crate::client::ObjectRef;

/// Name of the internal image stream produced by the pipeline.
pub const PIPELINE_IMAGE_STREAM: &str = "pipeline";

/// Release names with well-known meaning to the surrounding pipeline.
pub const INITIAL_RELEASE: &str = "initial";
pub const LATEST_RELEASE: &str = "latest";

/// Parameter exposing the registry's image format template.
pub const IMAGE_FORMAT_ENV: &str = "IMAGE_FORMAT";

/// Parameter exposing the IP pool lease handed out for AWS profiles.
pub const IP_POOL_LEASE_ENV: &str = "DEFAULT_IP_POOL_LEASE";

/// Secrets delivered into the namespace when a cluster claim is fulfilled.
pub const CLAIM_KUBECONFIG_SECRET: &str = "hive-admin-kubeconfig";
pub const CLAIM_KUBECONFIG_SECRET_KEY: &str = "kubeconfig";
pub const CLAIM_PASSWORD_SECRET: &str = "hive-admin-password";
pub const CLAIM_PASSWORD_SECRET_KEY: &str = "password";

/// Parameter name carrying the pull spec of the release image `release`.
pub fn release_image_env(release: &str) -> String {
    format!(
        "RELEASE_IMAGE_{}",
        release.to_uppercase().replace(['-', '.'], "_")
    )
}

/// Parameter name carrying the pull spec for an imagestream tag.
pub fn pull_spec_param(stream: &str, tag: &str) -> String {
    let clean = |s: &str| {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>()
    };
    format!("IMAGE_{}_{}", clean(stream), clean(tag))
}

/// The release stream holding payload images for a named release.
pub fn release_stream_for(release: &str) -> String {
    if release.is_empty() || release == LATEST_RELEASE {
        "stable".to_string()
    } else {
        format!("stable-{release}")
    }
}

// ---------------------------------------------------------------------------
// Steps and observers
// ---------------------------------------------------------------------------

/// Requested compute resources, as Kubernetes quantity strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// An environment parameter a step declares, with an optional default that
/// the test-level environment may override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepParameter {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
}

/// An image another step or the release pipeline produces, exposed to the
/// step under `env`. When `pull_spec` is set it is passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDependency {
    pub name: String,
    pub env: String,
    #[serde(default)]
    pub pull_spec: Option<String>,
}

/// DNS overrides applied to a step's pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
}

/// Node CPU architectures a step can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeArchitecture {
    Amd64,
    Arm64,
}

impl NodeArchitecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeArchitecture::Amd64 => "amd64",
            NodeArchitecture::Arm64 => "arm64",
        }
    }
}

/// One declared unit of test work, executed as one pod.
///
/// Supplied by the caller and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the test.
    pub name: String,
    /// Dependency name resolved to `stream:tag` coordinates.
    #[serde(default)]
    pub from: Option<String>,
    /// Raw pull spec imported under the internal pipeline stream.
    #[serde(default)]
    pub from_image: Option<String>,
    /// Inline command text, or the script body when `run_as_script` is set.
    #[serde(default)]
    pub commands: String,
    /// Run the commands from the mounted script config map instead of
    /// inlining them into the container command.
    #[serde(default)]
    pub run_as_script: bool,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub env: Vec<StepParameter>,
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
    #[serde(default)]
    pub credentials: Vec<CredentialReference>,
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    /// Release name whose CLI binary is injected into the pod.
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub grace_period_seconds: Option<u64>,
    /// A failing best-effort step does not fail its phase.
    #[serde(default)]
    pub best_effort: bool,
    /// Skip this step when every previous step succeeded.
    #[serde(default)]
    pub optional_on_success: bool,
    #[serde(default)]
    pub node_architecture: Option<NodeArchitecture>,
}

/// A long-lived auxiliary workload running concurrently with pre and test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub name: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_image: Option<String>,
    #[serde(default)]
    pub commands: String,
    #[serde(default)]
    pub resources: ResourceRequest,
}

impl Observer {
    /// Observers are just like steps, so one can be adapted to the other.
    pub fn as_step(&self) -> StepDefinition {
        StepDefinition {
            name: self.name.clone(),
            from: self.from.clone(),
            from_image: self.from_image.clone(),
            commands: self.commands.clone(),
            run_as_script: false,
            resources: self.resources.clone(),
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
        }
    }
}

// ---------------------------------------------------------------------------
// Credential references
// ---------------------------------------------------------------------------

/// How a credential reference addresses the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialSource {
    /// A single concrete field.
    Explicit {
        collection: String,
        group: String,
        field: String,
        alias: Option<String>,
    },
    /// All fields under a (collection, group) pair, discovered at run time.
    AutoDiscovery { collection: String, group: String },
    /// A named group of entries defined in the bundle configuration.
    Bundle { name: String },
}

/// A declarative pointer to one or more secret-store fields, mounted into
/// step pods at `mount_path`.
///
/// Exactly one addressing shape must be used; deserialization rejects
/// anything else, so a constructed reference is always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCredentialReference", into = "RawCredentialReference")]
pub struct CredentialReference {
    pub mount_path: String,
    pub source: CredentialSource,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RawCredentialReference {
    #[serde(default)]
    mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
}

impl TryFrom<RawCredentialReference> for CredentialReference {
    type Error = String;

    fn try_from(raw: RawCredentialReference) -> Result<Self, Self::Error> {
        if raw.mount_path.is_empty() {
            return Err("credential reference requires a mount_path".to_string());
        }
        let source = match (raw.bundle, raw.collection, raw.group, raw.field) {
            (Some(name), None, None, None) => CredentialSource::Bundle { name },
            (Some(_), ..) => {
                return Err(
                    "bundle is mutually exclusive with collection/group/field".to_string()
                )
            }
            (None, Some(collection), Some(group), Some(field)) => CredentialSource::Explicit {
                collection,
                group,
                field,
                alias: raw.alias,
            },
            (None, Some(collection), Some(group), None) => {
                CredentialSource::AutoDiscovery { collection, group }
            }
            _ => {
                return Err(
                    "credential reference must provide bundle, collection+group, or collection+group+field"
                        .to_string(),
                )
            }
        };
        Ok(CredentialReference {
            mount_path: raw.mount_path,
            source,
        })
    }
}

impl From<CredentialReference> for RawCredentialReference {
    fn from(cred: CredentialReference) -> Self {
        let mut raw = RawCredentialReference {
            mount_path: cred.mount_path,
            ..Default::default()
        };
        match cred.source {
            CredentialSource::Bundle { name } => raw.bundle = Some(name),
            CredentialSource::AutoDiscovery { collection, group } => {
                raw.collection = Some(collection);
                raw.group = Some(group);
            }
            CredentialSource::Explicit {
                collection,
                group,
                field,
                alias,
            } => {
                raw.collection = Some(collection);
                raw.group = Some(group);
                raw.field = Some(field);
                raw.alias = alias;
            }
        }
        raw
    }
}

/// A concrete (collection, group, field) tuple a reference resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedCredential {
    pub collection: String,
    pub group: String,
    pub field: String,
    pub alias: Option<String>,
    pub mount_path: String,
}

impl ResolvedCredential {
    /// File name the field is mounted under.
    pub fn mount_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.field)
    }
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

/// A field inside a bundle secret entry, optionally renamed on mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleField {
    pub name: String,
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
}

/// One secret entry of a bundle. An empty field list means every field under
/// the (collection, group) pair is discovered at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSecretRef {
    pub collection: String,
    pub group: String,
    #[serde(default)]
    pub fields: Vec<BundleField>,
}

/// A named, externally defined group of credential entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    #[serde(default)]
    pub secrets: Vec<BundleSecretRef>,
}

/// The loaded bundle definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default)]
    pub bundles: Vec<Bundle>,
}

impl BundleConfig {
    pub fn bundle(&self, name: &str) -> Option<&Bundle> {
        self.bundles.iter().find(|b| b.name == name)
    }
}

/// Secret-store coordinates threaded to the resolver and provisioning
/// instead of living in mutable module state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStoreSettings {
    /// Store project holding all CI secrets.
    pub project: String,
}

impl Default for SecretStoreSettings {
    fn default() -> Self {
        SecretStoreSettings {
            project: "conductor-ci-secrets".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster claims and leases
// ---------------------------------------------------------------------------

/// A request for a pre-provisioned cluster from the claim pool. Mutually
/// exclusive with a cluster profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterClaim {
    pub product: String,
    pub version: String,
    pub cloud: String,
    pub owner: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// The release renaming a fulfilled claim introduces: the claimed cluster's
/// payload takes over the `latest` release name for this test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRelease {
    pub release_name: String,
    pub override_name: String,
}

impl ClusterClaim {
    pub fn claim_release(&self, test_name: &str) -> ClaimRelease {
        ClaimRelease {
            release_name: format!("{LATEST_RELEASE}-{test_name}"),
            override_name: LATEST_RELEASE.to_string(),
        }
    }
}

/// A lease acquired upstream, exposed to steps through the named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLease {
    pub resource_type: String,
    pub env: String,
    #[serde(default = "default_lease_count")]
    pub count: u32,
}

fn default_lease_count() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Test configuration
// ---------------------------------------------------------------------------

/// The full declarative description of one multi-stage test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfiguration {
    /// Test name; prefixes every generated object.
    pub name: String,
    /// Namespace all objects are created in.
    pub namespace: String,
    /// Full job name, hashed into `JOB_NAME_HASH`.
    pub job_name: String,
    #[serde(default)]
    pub cluster_profile: Option<String>,
    #[serde(default)]
    pub cluster_claim: Option<ClusterClaim>,
    #[serde(default)]
    pub pre: Vec<StepDefinition>,
    #[serde(default)]
    pub test: Vec<StepDefinition>,
    #[serde(default)]
    pub post: Vec<StepDefinition>,
    #[serde(default)]
    pub observers: Vec<Observer>,
    /// Test-level overrides for declared step parameters.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub leases: Vec<StepLease>,
    #[serde(default)]
    pub allow_skip_on_success: bool,
    #[serde(default)]
    pub allow_best_effort_post_steps: bool,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub node_architecture: Option<NodeArchitecture>,
    /// Suffix appended to the test name when one configuration is run
    /// against multiple targets; stripped when deriving shared object names.
    #[serde(default)]
    pub target_additional_suffix: Option<String>,
    /// Image pull secret attached to the test service account.
    #[serde(default)]
    pub registry_pull_secret: Option<String>,
    /// Owner reference stamped onto generated pods for garbage collection.
    #[serde(default)]
    pub owner: Option<OwnerReference>,
}

impl TestConfiguration {
    /// All steps across the three phases, in phase order.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.pre.iter().chain(self.test.iter()).chain(self.post.iter())
    }

    /// Name of the cluster profile secret imported into the namespace. The
    /// additional target suffix is shared-object scoped, so it is stripped.
    pub fn profile_secret_name(&self) -> String {
        let base = match &self.target_additional_suffix {
            Some(suffix) => self
                .name
                .strip_suffix(format!("-{suffix}").as_str())
                .unwrap_or(&self.name),
            None => self.name.as_str(),
        };
        format!("{base}-cluster-profile")
    }

    /// Name of the config map holding every step's raw command text.
    pub fn commands_config_map_name(&self) -> String {
        format!("{}-commands", self.name)
    }

    /// Cloud type a cluster profile targets, by convention its first token.
    pub fn cluster_type(&self) -> Option<String> {
        self.cluster_profile
            .as_ref()
            .map(|p| p.split('-').next().unwrap_or(p).to_string())
    }

    /// Split a dependency name into imagestream coordinates. Names of the
    /// form `stream:tag` are explicit; bare names come from the stable
    /// release stream, renamed when a cluster claim overrides `latest`.
    pub fn dependency_parts(&self, name: &str, claim: Option<&ClaimRelease>) -> (String, String) {
        if let Some((stream, tag)) = name.split_once(':') {
            return (stream.to_string(), tag.to_string());
        }
        let stream = match claim {
            Some(c) if c.override_name == LATEST_RELEASE => {
                format!("stable-{}", c.release_name)
            }
            _ => "stable".to_string(),
        };
        (stream, name.to_string())
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Behavior switches carried across one run.
///
/// `fail_fast` is set for pre and test and cleared for post;
/// `has_prev_errs` feeds the skip-on-success logic. Only the phase executor
/// mutates these between phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub fail_fast: bool,
    pub has_prev_errs: bool,
    pub allow_skip_on_success: bool,
    pub allow_best_effort_post_steps: bool,
}

/// The three ordered phases of a multi-stage test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Test,
    Post,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Test => "test",
            Phase::Post => "post",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one step pod.
#[derive(Debug, Clone)]
pub struct StepDetail {
    pub name: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub failed: bool,
    /// Objects the per-step client observed being written.
    pub manifests: Vec<ObjectRef>,
}

/// Summary record of one phase (or one observed sub-result).
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub name: String,
    pub duration: Duration,
    pub output: String,
    pub failure_output: Option<String>,
}
