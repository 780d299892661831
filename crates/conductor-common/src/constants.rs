// Shared constants: labels, mount paths, environment variable names, and the
// shell prelude prepended to inline step commands.

// ---------------------------------------------------------------------------
// Labels and annotations
// ---------------------------------------------------------------------------

/// Label marking a pod as part of a multi-stage test. The value is the test
/// name, so all pods of one test can be selected (and deleted) in bulk.
pub const MULTI_STAGE_TEST_LABEL: &str = "ci.conductor.dev/multi-stage-test";

/// Label carrying the step name a pod was generated from.
pub const STEP_NAME_LABEL: &str = "ci.conductor.dev/step";

/// Secrets carrying this label are excluded from censoring volumes.
pub const SKIP_CENSORING_LABEL: &str = "ci.conductor.dev/skip-censoring";

/// Annotation asking the log uploader to save container logs for the pod.
pub const SAVE_CONTAINER_LOGS_ANNOTATION: &str = "ci.conductor.dev/save-container-logs";

/// Annotation Kubernetes puts on secrets that back a service account token.
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Namespace annotation holding the `${base}/${size}` UID range assigned by
/// the cluster's security-context controller.
pub const NAMESPACE_UID_RANGE_ANNOTATION: &str = "openshift.io/sa.scc.uid-range";

// ---------------------------------------------------------------------------
// Mount paths and volume names
// ---------------------------------------------------------------------------

/// Where the shared-state secret is mounted in every step pod.
pub const SHARED_DIR_MOUNT_PATH: &str = "/var/run/secrets/ci.conductor.dev/multi-stage";

/// Where the cluster profile secret is mounted.
pub const CLUSTER_PROFILE_MOUNT_PATH: &str = "/var/run/secrets/ci.conductor.dev/cluster-profile";

/// Where the command script config map is mounted.
pub const COMMAND_SCRIPT_MOUNT_PATH: &str = "/var/run/configmaps/ci.conductor.dev/multi-stage";

/// Where an injected CLI binary lands.
pub const CLI_MOUNT_PATH: &str = "/cli";

/// Writable home directory for the step container.
pub const HOME_MOUNT_PATH: &str = "/home/ci";

/// Shared-memory mount point backed by a memory-medium volume.
pub const SHM_MOUNT_PATH: &str = "/dev/shm";

/// Name of the writable home volume added to every step pod.
pub const HOME_VOLUME_NAME: &str = "home";

/// Name of the cluster profile volume.
pub const PROFILE_VOLUME_NAME: &str = "cluster-profile";

/// Readiness file the VPN sidecar touches once the tunnel is up.
pub const VPN_READY_FILE: &str = "/tmp/vpn/up";

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

/// Exposes the shared directory to step commands.
pub const SHARED_DIR_ENV: &str = "SHARED_DIR";

/// Exposes the cluster profile directory to step commands.
pub const CLUSTER_PROFILE_DIR_ENV: &str = "CLUSTER_PROFILE_DIR";

/// Exposes the cluster type derived from the profile name.
pub const CLUSTER_TYPE_ENV: &str = "CLUSTER_TYPE";

/// Exposes the directory containing an injected CLI binary.
pub const CLI_DIR_ENV: &str = "CLI_DIR";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Strict-mode prelude prepended to inline step commands.
pub const COMMAND_PREFIX: &str = "#!/bin/bash\nset -eu\n";

/// Resource name a step uses to request shared memory. Not a real Kubernetes
/// resource: the generator strips it and materializes a memory-backed volume.
pub const SHM_RESOURCE: &str = "conductor.dev/shm";

/// Kubernetes DNS label length limit, bounding generated object names.
pub const KUBERNETES_DNS_LABEL_LIMIT: usize = 63;
