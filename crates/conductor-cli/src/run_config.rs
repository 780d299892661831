// On-disk run configuration: the test description plus the ambient pieces
// the engine needs (bundle definitions, upstream parameters, store
// settings).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use conductor_engine::api::{BundleConfig, SecretStoreSettings, TestConfiguration};
use conductor_engine::client::{ParameterError, ParameterSource};

/// Everything one `conductor run` invocation needs, from a single YAML file.
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    pub test: TestConfiguration,
    /// Bundle definitions referenced by `bundle:` credentials.
    #[serde(default)]
    pub bundles: Option<BundleConfig>,
    /// Upstream-produced variables (lease identifiers, pull specs).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub store: SecretStoreSettings,
    /// Deliver credentials through the secrets-store CSI driver instead of
    /// copied secrets.
    #[serde(default)]
    pub enable_csi_driver: bool,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<RunConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read run config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("could not parse run config {}", path.display()))
    }
}

/// Parameters declared in the run config, with the process environment as a
/// fallback for values injected by the surrounding pipeline.
pub struct ConfiguredParams {
    values: HashMap<String, String>,
}

impl ConfiguredParams {
    pub fn new(values: HashMap<String, String>) -> Self {
        ConfiguredParams { values }
    }
}

impl ParameterSource for ConfiguredParams {
    fn get(&self, name: &str) -> Result<String, ParameterError> {
        if let Some(value) = self.values.get(name) {
            return Ok(value.clone());
        }
        std::env::var(name).map_err(|_| ParameterError(name.to_string()))
    }
}
