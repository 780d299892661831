// VPN support. A `vpn.yaml` file in the cluster profile secret triggers the
// injection of a VPN client sidecar into every step pod; this module parses
// that configuration and resolves the namespace UID range the security
// context pass needs.

use k8s_openapi::api::core::v1::Secret;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use conductor_common::constants::NAMESPACE_UID_RANGE_ANNOTATION;

use crate::client::ClusterClient;
use crate::errors::OrchestratorError;

/// Key of the VPN configuration file in the cluster profile secret.
pub const VPN_CONFIG_KEY: &str = "vpn.yaml";

/// Parses the base UID from a `${base}/${size}` UID range annotation.
static UID_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)/\d+").expect("valid regex"));

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVpnConfig {
    /// Pull spec of the VPN client image.
    image: String,
    /// Key in the profile secret holding the client's entry point script.
    commands: String,
    /// How long the entrypoint wrapper waits for the tunnel, in seconds.
    #[serde(default)]
    wait_timeout: Option<u64>,
}

/// VPN sidecar configuration, immutable once loaded from the profile.
#[derive(Debug, Clone)]
pub struct VpnConfig {
    pub image: String,
    /// The client's entry point, executed as a bash script.
    pub commands: String,
    pub wait_timeout: Option<u64>,
    /// Base UID of the test namespace; resolved once per run and cached
    /// here for the security-context pass.
    pub namespace_uid: i64,
}

/// Read the VPN configuration out of the cluster profile secret. Absence of
/// the configuration file simply means no VPN.
pub fn read_vpn_config(secret: &Secret) -> Result<Option<VpnConfig>, OrchestratorError> {
    let data = secret.data.as_ref();
    let Some(raw_bytes) = data.and_then(|d| d.get(VPN_CONFIG_KEY)) else {
        return Ok(None);
    };
    let raw: RawVpnConfig = serde_yaml::from_slice(&raw_bytes.0).map_err(|e| {
        OrchestratorError::Configuration(format!("failed to read VPN configuration file: {e}"))
    })?;
    if raw.image.is_empty() {
        return Err(OrchestratorError::Configuration(
            "VPN image missing in configuration file".to_string(),
        ));
    }
    if raw.commands.is_empty() {
        return Err(OrchestratorError::Configuration(
            "VPN script missing in configuration file".to_string(),
        ));
    }
    let script = data.and_then(|d| d.get(&raw.commands)).ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "invalid \"commands\" value {:?}, not found",
            raw.commands
        ))
    })?;
    let commands = String::from_utf8(script.0.clone()).map_err(|e| {
        OrchestratorError::Configuration(format!("VPN script is not valid UTF-8: {e}"))
    })?;
    Ok(Some(VpnConfig {
        image: raw.image,
        commands,
        wait_timeout: raw.wait_timeout,
        namespace_uid: 0,
    }))
}

/// Base UID assigned to the test namespace. Unprivileged containers must be
/// pinned to this UID explicitly: the cluster's security profile stops
/// applying its defaults once any container in the pod asks for more.
pub async fn namespace_uid(
    client: &dyn ClusterClient,
    namespace: &str,
) -> Result<i64, OrchestratorError> {
    let ns = client
        .get_namespace(namespace)
        .await?
        .ok_or_else(|| {
            OrchestratorError::Configuration(format!("test namespace {namespace} not found"))
        })?;
    let range = ns
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NAMESPACE_UID_RANGE_ANNOTATION))
        .cloned()
        .unwrap_or_default();
    parse_namespace_uid(&range)
}

/// Extract the base UID from a `${base}/${size}` range.
pub fn parse_namespace_uid(range: &str) -> Result<i64, OrchestratorError> {
    let invalid =
        || OrchestratorError::Configuration(format!("invalid namespace UID range: {range}"));
    let captures = UID_RANGE.captures(range).ok_or_else(invalid)?;
    let uid: i64 = captures[1].parse().map_err(|_| invalid())?;
    if uid == 0 {
        return Err(invalid());
    }
    Ok(uid)
}
