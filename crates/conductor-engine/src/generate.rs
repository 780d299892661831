// Pod generation: turns step definitions into fully-specified pods with
// volumes, credentials, sidecars, and security contexts. Per-step failures
// (resource parsing, dependency resolution, claim parameter lookup) are
// collected rather than short-circuited so one bad step does not mask the
// others.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Capabilities, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar,
    HostPathVolumeSource, Pod, PodDNSConfig, PodSpec, ResourceRequirements, SELinuxOptions,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use conductor_common::constants::{
    CLI_DIR_ENV, CLI_MOUNT_PATH, CLUSTER_PROFILE_DIR_ENV, CLUSTER_PROFILE_MOUNT_PATH,
    CLUSTER_TYPE_ENV, COMMAND_PREFIX, COMMAND_SCRIPT_MOUNT_PATH, HOME_MOUNT_PATH,
    HOME_VOLUME_NAME, MULTI_STAGE_TEST_LABEL, PROFILE_VOLUME_NAME,
    SAVE_CONTAINER_LOGS_ANNOTATION, SHARED_DIR_ENV, SHARED_DIR_MOUNT_PATH, SHM_MOUNT_PATH,
    SHM_RESOURCE, STEP_NAME_LABEL, VPN_READY_FILE,
};
use conductor_common::naming::{job_name_hash, per_test_object_name, sanitize_job_name, volume_name};

use crate::api::{
    pull_spec_param, release_stream_for, Observer, ResolvedCredential, RunFlags, StepDefinition,
    TestConfiguration, CLAIM_KUBECONFIG_SECRET, CLAIM_KUBECONFIG_SECRET_KEY,
    CLAIM_PASSWORD_SECRET, CLAIM_PASSWORD_SECRET_KEY, PIPELINE_IMAGE_STREAM,
};
use crate::client::ParameterSource;
use crate::csi::{self, CSI_DRIVER_NAME};
use crate::errors::{ErrorList, OrchestratorError};
use crate::vpn::VpnConfig;

/// Name of the main container in every step pod.
pub const CONTAINER_NAME: &str = "test";

/// Name of the VPN client sidecar.
pub const VPN_CONTAINER_NAME: &str = "vpn-client";

/// Image delivering the entrypoint wrapper binary.
pub const ENTRYPOINT_WRAPPER_IMAGE: &str = "registry.conductor.dev/ci/entrypoint-wrapper:latest";

/// Default step timeout (two hours) and grace period.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 15;

/// Mount path of a censoring copy of a secret.
pub fn censor_secret_mount_path(secret_name: &str) -> String {
    format!("/secrets/{secret_name}")
}

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$").expect("valid regex")
});

/// Options tweaking pod generation per call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratePodOptions {
    /// Observers ignore the skip-on-success logic: they have no phase
    /// membership and always run.
    pub is_observer: bool,
}

/// Context shared by all pod generation calls of one run.
pub struct PodGenerator<'a> {
    pub config: &'a TestConfiguration,
    pub flags: RunFlags,
    pub params: &'a dyn ParameterSource,
    pub vpn: Option<&'a VpnConfig>,
    pub enable_csi_driver: bool,
    /// Per-step resolved credentials, keyed by step name.
    pub resolved_credentials: &'a HashMap<String, Vec<ResolvedCredential>>,
}

impl PodGenerator<'_> {
    /// Generate one pod per step, skipping steps whose skip-on-success
    /// condition matches the current flags, and return the names of the
    /// pods belonging to best-effort steps.
    pub fn generate_pods(
        &self,
        steps: &[StepDefinition],
        env: &[EnvVar],
        censor_volumes: &[Volume],
        censor_mounts: &[VolumeMount],
        opts: GeneratePodOptions,
    ) -> Result<(Vec<Pod>, HashSet<String>), OrchestratorError> {
        let mut pods = Vec::new();
        let mut best_effort = HashSet::new();
        let mut errs = ErrorList::new();
        let claim_release = self
            .config
            .cluster_claim
            .as_ref()
            .map(|c| c.claim_release(&self.config.name));

        for step in steps {
            let name = format!("{}-{}", self.config.name, step.name);
            if !opts.is_observer
                && step.optional_on_success
                && self.flags.allow_skip_on_success
                && !self.flags.has_prev_errs
            {
                info!("Skipping optional step {name}");
                continue;
            }
            if self.flags.allow_best_effort_post_steps && step.best_effort {
                best_effort.insert(name.clone());
            }

            let image = match self.resolve_image(step, claim_release.as_ref()) {
                Ok(image) => image,
                Err(err) => {
                    errs.push(err);
                    continue;
                }
            };
            let (resources, shm_size) = match container_resources(step) {
                Ok(parts) => parts,
                Err(err) => {
                    errs.push(err);
                    continue;
                }
            };

            let mut pod = self.base_pod(step, &name, &image, resources);
            pod.spec
                .get_or_insert_with(PodSpec::default)
                .volumes
                .get_or_insert_with(Vec::new)
                .extend(censor_volumes.iter().cloned());

            add_entrypoint_wrapper(&mut pod, self.vpn);
            if let Some(vpn) = self.vpn {
                add_vpn_client(&mut pod, vpn);
            }

            let mut container_env = vec![
                env_var("NAMESPACE", &self.config.namespace),
                env_var("JOB_NAME_SAFE", &sanitize_job_name(&self.config.name)),
                env_var("JOB_NAME_HASH", &job_name_hash(&self.config.job_name)),
            ];
            container_env.extend(env.iter().cloned());
            container_env.extend(self.generate_params(step));
            match self.env_for_dependencies(step, claim_release.as_ref()) {
                Ok(dependency_env) => container_env.extend(dependency_env),
                Err(dependency_errs) => {
                    for err in dependency_errs.0 {
                        errs.push(err);
                    }
                    continue;
                }
            }

            if self.config.cluster_claim.is_some() {
                match claim_pod_params(censor_mounts, &self.config.name) {
                    Ok((claim_env, claim_mounts)) => {
                        container_env.extend(claim_env);
                        // The volumes already exist in the pod for the
                        // censoring sidecar; only the mounts are added here.
                        main_container(&mut pod)
                            .volume_mounts
                            .get_or_insert_with(Vec::new)
                            .extend(claim_mounts);
                    }
                    Err(err) => {
                        errs.push(err.context("failed to get cluster claim pod params"));
                    }
                }
            } else {
                container_env.push(env_var(
                    "KUBECONFIG",
                    &format!("{SHARED_DIR_MOUNT_PATH}/kubeconfig"),
                ));
                container_env.push(env_var(
                    "KUBEADMIN_PASSWORD_FILE",
                    &format!("{SHARED_DIR_MOUNT_PATH}/kubeadmin-password"),
                ));
            }
            main_container(&mut pod)
                .env
                .get_or_insert_with(Vec::new)
                .extend(container_env);

            if let Some(size) = shm_size {
                add_shm_volume(&mut pod, &size);
            }
            if self.config.cluster_profile.is_some() {
                self.add_profile(&mut pod);
            }
            if let Some(cli) = &step.cli {
                let dependency = format!("{}:cli", release_stream_for(cli));
                let (stream, _) = self
                    .config
                    .dependency_parts(&dependency, claim_release.as_ref());
                add_cli_injector(&stream, &mut pod);
            }
            add_shared_dir_secret(&self.config.name, &mut pod);
            self.add_credentials(step, &mut pod);
            if step.run_as_script {
                add_command_script(&self.config.commands_config_map_name(), &mut pod);
            }
            if let Some(vpn) = self.vpn {
                let capabilities = Capabilities {
                    add: Some(vec!["NET_ADMIN".to_string()]),
                    drop: Some(vec!["ALL".to_string()]),
                };
                let selinux = SELinuxOptions {
                    user: Some("system_u".to_string()),
                    role: Some("system_r".to_string()),
                    type_: Some("container_runtime_t".to_string()),
                    level: Some("s0".to_string()),
                    ..SELinuxOptions::default()
                };
                set_security_contexts(
                    &mut pod,
                    VPN_CONTAINER_NAME,
                    vpn.namespace_uid,
                    capabilities,
                    selinux,
                );
            }

            pods.push(pod);
        }

        if errs.is_empty() {
            Ok((pods, best_effort))
        } else {
            Err(OrchestratorError::Generation(errs))
        }
    }

    /// Generate pods for observers, which are steps with no phase
    /// membership, no caller environment, and no credentials.
    pub fn generate_observer_pods(
        &self,
        observers: &[Observer],
        censor_volumes: &[Volume],
        censor_mounts: &[VolumeMount],
    ) -> Result<Vec<Pod>, OrchestratorError> {
        let adapted: Vec<StepDefinition> = observers.iter().map(Observer::as_step).collect();
        let (pods, _) = self.generate_pods(
            &adapted,
            &[],
            censor_volumes,
            censor_mounts,
            GeneratePodOptions { is_observer: true },
        )?;
        Ok(pods)
    }

    fn resolve_image(
        &self,
        step: &StepDefinition,
        claim: Option<&crate::api::ClaimRelease>,
    ) -> Result<String, OrchestratorError> {
        if let Some(pull_spec) = &step.from_image {
            // Imported images live under the pipeline stream with a tag
            // derived from the pull spec.
            let digest = Sha256::digest(pull_spec.as_bytes());
            let tag = hex::encode(&digest[..4]);
            return Ok(format!("{PIPELINE_IMAGE_STREAM}:{tag}"));
        }
        if let Some(from) = &step.from {
            let (stream, tag) = self.config.dependency_parts(from, claim);
            return Ok(format!("{stream}:{tag}"));
        }
        Err(OrchestratorError::Configuration(format!(
            "step {} declares neither from nor from_image",
            step.name
        )))
    }

    fn base_pod(
        &self,
        step: &StepDefinition,
        name: &str,
        image: &str,
        resources: ResourceRequirements,
    ) -> Pod {
        let timeout = step.timeout_seconds.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let grace_period = step.grace_period_seconds.unwrap_or(DEFAULT_GRACE_PERIOD_SECS);
        // The uploader needs time of its own after the process is told to
        // stop, assuming an 80/20 distribution of work.
        let termination_grace = (grace_period * 5 / 4) as i64;

        let command = if step.run_as_script {
            vec![format!("{COMMAND_SCRIPT_MOUNT_PATH}/{}", step.name)]
        } else {
            vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("{COMMAND_PREFIX}{}", step.commands),
            ]
        };

        let mut labels = BTreeMap::new();
        labels.insert(STEP_NAME_LABEL.to_string(), step.name.clone());
        labels.insert(MULTI_STAGE_TEST_LABEL.to_string(), self.config.name.clone());
        let mut annotations = BTreeMap::new();
        annotations.insert(SAVE_CONTAINER_LOGS_ANNOTATION.to_string(), "true".to_string());

        let node_selector = step
            .node_architecture
            .or(self.config.node_architecture)
            .map(|arch| {
                let mut selector = BTreeMap::new();
                selector.insert("kubernetes.io/arch".to_string(), arch.as_str().to_string());
                selector
            });

        let mut dns_policy = None;
        let dns_config = step.dns.as_ref().map(|dns| {
            if !dns.nameservers.is_empty() {
                dns_policy = Some("None".to_string());
            }
            PodDNSConfig {
                nameservers: Some(dns.nameservers.clone()),
                searches: Some(dns.searches.clone()),
                ..PodDNSConfig::default()
            }
        });

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: self.config.owner.clone().map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(self.config.name.clone()),
                node_name: self.config.node_name.clone(),
                node_selector,
                active_deadline_seconds: Some(timeout as i64),
                termination_grace_period_seconds: Some(termination_grace),
                dns_policy,
                dns_config,
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(image.to_string()),
                    command: Some(command),
                    resources: Some(resources),
                    termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                    env: Some(Vec::new()),
                    volume_mounts: Some(vec![
                        volume_mount(HOME_VOLUME_NAME, HOME_MOUNT_PATH),
                        volume_mount("logs", "/logs"),
                    ]),
                    ..Container::default()
                }],
                volumes: Some(vec![
                    empty_dir_volume(HOME_VOLUME_NAME),
                    empty_dir_volume("logs"),
                ]),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    /// Declared step parameters, with test-level environment overrides.
    fn generate_params(&self, step: &StepDefinition) -> Vec<EnvVar> {
        step.env
            .iter()
            .map(|param| {
                let mut value = param.default.clone().unwrap_or_default();
                if let Some(v) = self.config.environment.get(&param.name) {
                    value = v.clone();
                }
                env_var(&param.name, &value)
            })
            .collect()
    }

    /// Pull specs for the step's declared dependencies, either passed
    /// through verbatim or resolved through the parameter source.
    fn env_for_dependencies(
        &self,
        step: &StepDefinition,
        claim: Option<&crate::api::ClaimRelease>,
    ) -> Result<Vec<EnvVar>, ErrorList> {
        let mut env = Vec::new();
        let mut errs = ErrorList::new();
        for dependency in &step.dependencies {
            if let Some(pull_spec) = &dependency.pull_spec {
                env.push(env_var(&dependency.env, pull_spec));
                continue;
            }
            let (stream, tag) = self.config.dependency_parts(&dependency.name, claim);
            match self.params.get(&pull_spec_param(&stream, &tag)) {
                Ok(pull_spec) => env.push(env_var(&dependency.env, &pull_spec)),
                Err(_) => errs.push(OrchestratorError::Parameter(format!(
                    "could not determine image pull spec for image {} on step {}",
                    dependency.name, step.name
                ))),
            }
        }
        if errs.is_empty() {
            Ok(env)
        } else {
            Err(errs)
        }
    }

    fn add_profile(&self, pod: &mut Pod) {
        add_volume(
            pod,
            Volume {
                name: PROFILE_VOLUME_NAME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.config.profile_secret_name()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
        );
        let cluster_type = self.config.cluster_type().unwrap_or_default();
        let container = main_container(pod);
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(volume_mount(PROFILE_VOLUME_NAME, CLUSTER_PROFILE_MOUNT_PATH));
        container.env.get_or_insert_with(Vec::new).extend([
            env_var(CLUSTER_TYPE_ENV, &cluster_type),
            env_var(CLUSTER_PROFILE_DIR_ENV, CLUSTER_PROFILE_MOUNT_PATH),
        ]);
    }

    /// Mount the step's resolved credentials, either as CSI volumes backed
    /// by provider classes or as plain secret volumes.
    fn add_credentials(&self, step: &StepDefinition, pod: &mut Pod) {
        let Some(resolved) = self.resolved_credentials.get(&step.name) else {
            return;
        };
        if self.enable_csi_driver {
            for ((_, _, mount_path), group) in csi::group_credentials(resolved) {
                let name = csi::csi_volume_name(&self.config.namespace, &group);
                let class = csi::provider_class_name(&self.config.namespace, &group);
                let mut attributes = BTreeMap::new();
                attributes.insert("secretProviderClass".to_string(), class);
                add_volume(
                    pod,
                    Volume {
                        name: name.clone(),
                        csi: Some(CSIVolumeSource {
                            driver: CSI_DRIVER_NAME.to_string(),
                            read_only: Some(true),
                            volume_attributes: Some(attributes),
                            ..CSIVolumeSource::default()
                        }),
                        ..Volume::default()
                    },
                );
                main_container(pod)
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(volume_mount(&name, &mount_path));
            }
        } else {
            let mut seen = HashSet::new();
            for credential in resolved {
                let key = (
                    credential.collection.clone(),
                    credential.group.clone(),
                    credential.mount_path.clone(),
                );
                if !seen.insert(key) {
                    continue;
                }
                let name = volume_name(&credential.collection, &credential.group);
                add_volume(
                    pod,
                    Volume {
                        name: name.clone(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(format!(
                                "{}-{}",
                                credential.collection, credential.group
                            )),
                            ..SecretVolumeSource::default()
                        }),
                        ..Volume::default()
                    },
                );
                main_container(pod)
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(volume_mount(&name, &credential.mount_path));
            }
        }
    }
}

/// Parsed container resources, with a shared-memory request split out: the
/// platform cannot express shm as a resource limit, so it becomes a
/// memory-backed volume instead.
fn container_resources(
    step: &StepDefinition,
) -> Result<(ResourceRequirements, Option<String>), OrchestratorError> {
    let mut errs = ErrorList::new();
    for (name, value) in step.resources.requests.iter().chain(step.resources.limits.iter()) {
        if !QUANTITY.is_match(value) {
            errs.push(OrchestratorError::Configuration(format!(
                "invalid resource quantity {value:?} for {name} on step {}",
                step.name
            )));
        }
    }
    if !errs.is_empty() {
        return Err(OrchestratorError::Generation(errs));
    }

    let shm_size = step.resources.requests.get(SHM_RESOURCE).cloned();
    if shm_size.is_some() {
        info!("removing shm from resources for container");
    }
    let quantities = |entries: &BTreeMap<String, String>| -> Option<BTreeMap<String, Quantity>> {
        let filtered: BTreeMap<String, Quantity> = entries
            .iter()
            .filter(|(name, _)| name.as_str() != SHM_RESOURCE)
            .map(|(name, value)| (name.clone(), Quantity(value.clone())))
            .collect();
        if filtered.is_empty() {
            None
        } else {
            Some(filtered)
        }
    };
    Ok((
        ResourceRequirements {
            requests: quantities(&step.resources.requests),
            limits: quantities(&step.resources.limits),
            ..ResourceRequirements::default()
        },
        shm_size,
    ))
}

/// Wrap the main container's entry point with the uploader shim delivered by
/// an init container. When the VPN is configured with a wait timeout, the
/// shim first waits for the tunnel's readiness file.
fn add_entrypoint_wrapper(pod: &mut Pod, vpn: Option<&VpnConfig>) {
    let volume = "entrypoint-wrapper";
    let dir = "/tmp/entrypoint-wrapper";
    let bin = format!("{dir}/entrypoint-wrapper");
    add_volume(pod, empty_dir_volume(volume));
    let mount = volume_mount(volume, dir);
    pod.spec
        .get_or_insert_with(PodSpec::default)
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(Container {
            name: "cp-entrypoint-wrapper".to_string(),
            image: Some(ENTRYPOINT_WRAPPER_IMAGE.to_string()),
            command: Some(vec!["cp".to_string()]),
            args: Some(vec!["/bin/entrypoint-wrapper".to_string(), bin.clone()]),
            volume_mounts: Some(vec![mount.clone()]),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            ..Container::default()
        });
    let container = main_container(pod);
    let original_args = container.args.take().unwrap_or_default();
    let original_command = container.command.take().unwrap_or_default();
    let mut args = Vec::new();
    if let Some(wait_timeout) = vpn.and_then(|c| c.wait_timeout) {
        args.extend([
            "--wait-for-file".to_string(),
            VPN_READY_FILE.to_string(),
            "--wait-timeout".to_string(),
            format!("{wait_timeout}s"),
        ]);
    }
    args.extend(original_command);
    args.extend(original_args);
    container.command = Some(vec![bin]);
    container.args = Some(args);
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(mount);
}

fn add_vpn_client(pod: &mut Pod, vpn: &VpnConfig) {
    let profile_mount = "/tmp/profile";
    let vpn_mount = volume_mount("vpn", "/tmp/vpn");
    pod.spec
        .get_or_insert_with(PodSpec::default)
        .containers
        .push(Container {
            name: VPN_CONTAINER_NAME.to_string(),
            image: Some(vpn.image.clone()),
            command: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                vpn.commands.clone(),
            ]),
            working_dir: Some(profile_mount.to_string()),
            volume_mounts: Some(vec![
                volume_mount("tun", "/dev/net/tun"),
                vpn_mount.clone(),
                volume_mount("logs", "/logs"),
                volume_mount(PROFILE_VOLUME_NAME, profile_mount),
            ]),
            ..Container::default()
        });
    add_volume(pod, empty_dir_volume("vpn"));
    add_volume(
        pod,
        Volume {
            name: "tun".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/dev/net/tun".to_string(),
                type_: Some("CharDevice".to_string()),
            }),
            ..Volume::default()
        },
    );
    main_container(pod)
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(vpn_mount);
}

/// Configure the security context of every container in the pod. `root`
/// names the single container allowed to run as UID 0 with the supplied
/// capabilities and SELinux options; all others are pinned to the namespace
/// UID, since the cluster's security defaults stop applying to the rest of
/// a multi-container pod once one container needs more.
fn set_security_contexts(
    pod: &mut Pod,
    root: &str,
    uid: i64,
    capabilities: Capabilities,
    selinux: SELinuxOptions,
) {
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    let mut apply = |containers: &mut Vec<Container>| {
        for container in containers {
            container.security_context = if container.name == root {
                Some(SecurityContext {
                    run_as_user: Some(0),
                    capabilities: Some(capabilities.clone()),
                    se_linux_options: Some(selinux.clone()),
                    ..SecurityContext::default()
                })
            } else {
                Some(SecurityContext {
                    run_as_non_root: Some(true),
                    run_as_user: Some(uid),
                    ..SecurityContext::default()
                })
            };
        }
    };
    if let Some(init) = spec.init_containers.as_mut() {
        apply(init);
    }
    apply(&mut spec.containers);
}

fn add_shm_volume(pod: &mut Pod, size: &str) {
    add_volume(
        pod,
        Volume {
            name: "dshm".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: Some(Quantity(size.to_string())),
            }),
            ..Volume::default()
        },
    );
    main_container(pod)
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(volume_mount("dshm", SHM_MOUNT_PATH));
}

fn add_cli_injector(stream: &str, pod: &mut Pod) {
    let volume = "cli";
    add_volume(pod, empty_dir_volume(volume));
    pod.spec
        .get_or_insert_with(PodSpec::default)
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(Container {
            name: "inject-cli".to_string(),
            image: Some(format!("{stream}:cli")),
            command: Some(vec!["/bin/cp".to_string()]),
            args: Some(vec!["/usr/bin/oc".to_string(), CLI_MOUNT_PATH.to_string()]),
            volume_mounts: Some(vec![volume_mount(volume, CLI_MOUNT_PATH)]),
            ..Container::default()
        });
    let container = main_container(pod);
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(volume_mount(volume, CLI_MOUNT_PATH));
    container
        .env
        .get_or_insert_with(Vec::new)
        .push(env_var(CLI_DIR_ENV, CLI_MOUNT_PATH));
}

fn add_shared_dir_secret(secret: &str, pod: &mut Pod) {
    add_volume(
        pod,
        Volume {
            name: secret.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    );
    let container = main_container(pod);
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(volume_mount(secret, SHARED_DIR_MOUNT_PATH));
    container
        .env
        .get_or_insert_with(Vec::new)
        .push(env_var(SHARED_DIR_ENV, SHARED_DIR_MOUNT_PATH));
}

fn add_command_script(config_map: &str, pod: &mut Pod) {
    let volume = "commands-script";
    add_volume(
        pod,
        Volume {
            name: volume.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                default_mode: Some(0o777),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
    );
    main_container(pod)
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(volume_mount(volume, COMMAND_SCRIPT_MOUNT_PATH));
}

/// Env vars and mounts pointing a step at its claimed cluster's admin
/// credentials. The claim secrets are already present as censoring volumes;
/// this locates their mounts and re-targets them at the test container.
fn claim_pod_params(
    censor_mounts: &[VolumeMount],
    test_name: &str,
) -> Result<(Vec<EnvVar>, Vec<VolumeMount>), OrchestratorError> {
    let mut env = Vec::new();
    let mut mounts = Vec::new();
    let mut errs = ErrorList::new();
    for (secret, env_name, key) in [
        (CLAIM_KUBECONFIG_SECRET, "KUBECONFIG", CLAIM_KUBECONFIG_SECRET_KEY),
        (CLAIM_PASSWORD_SECRET, "KUBEADMIN_PASSWORD_FILE", CLAIM_PASSWORD_SECRET_KEY),
    ] {
        let secret_name = per_test_object_name(secret, test_name);
        let mount_path = censor_secret_mount_path(&secret_name);
        match censor_mounts.iter().find(|m| m.mount_path == mount_path) {
            Some(mount) => {
                mounts.push(mount.clone());
                env.push(env_var(env_name, &format!("{}/{key}", mount.mount_path)));
            }
            None => errs.push(OrchestratorError::Configuration(format!(
                "failed to find mount path {mount_path} for claim secret {secret_name}"
            ))),
        }
    }
    errs.into_result()?;
    Ok((env, mounts))
}

fn main_container(pod: &mut Pod) -> &mut Container {
    // The main container is always the first one; the generator builds the
    // pod with it in place before any sidecars are appended.
    &mut pod
        .spec
        .get_or_insert_with(PodSpec::default)
        .containers[0]
}

fn add_volume(pod: &mut Pod, volume: Volume) {
    pod.spec
        .get_or_insert_with(PodSpec::default)
        .volumes
        .get_or_insert_with(Vec::new)
        .push(volume);
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

pub(crate) fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ResourceRequest, StepParameter};
    use crate::testing::StaticParams;

    fn step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            from: Some("cli".to_string()),
            from_image: None,
            commands: "echo hello".to_string(),
            run_as_script: false,
            resources: ResourceRequest::default(),
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

    fn config() -> TestConfiguration {
        TestConfiguration {
            name: "e2e".to_string(),
            namespace: "ci-op-1234".to_string(),
            job_name: "pull-ci-org-repo-branch-e2e".to_string(),
            ..TestConfiguration::default()
        }
    }

    fn generator<'a>(
        config: &'a TestConfiguration,
        params: &'a StaticParams,
        resolved: &'a HashMap<String, Vec<ResolvedCredential>>,
    ) -> PodGenerator<'a> {
        PodGenerator {
            config,
            flags: RunFlags::default(),
            params,
            vpn: None,
            enable_csi_driver: false,
            resolved_credentials: resolved,
        }
    }

    fn container<'a>(pod: &'a Pod, name: &str) -> &'a Container {
        pod.spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_generate_pods_names_and_ordering() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let steps = vec![step("pre0"), step("pre1")];
        let (pods, best_effort) = generator
            .generate_pods(&steps, &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let names: Vec<_> = pods
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["e2e-pre0", "e2e-pre1"]);
        assert!(best_effort.is_empty());
        let labels = pods[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels[MULTI_STAGE_TEST_LABEL], "e2e");
        assert_eq!(labels[STEP_NAME_LABEL], "pre0");
    }

    #[test]
    fn test_skip_on_success_respects_flags() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let mut generator = generator(&config, &params, &resolved);
        generator.flags.allow_skip_on_success = true;

        let mut optional = step("gather");
        optional.optional_on_success = true;
        let steps = vec![optional];

        let (pods, _) = generator
            .generate_pods(&steps, &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        assert!(pods.is_empty());

        generator.flags.has_prev_errs = true;
        let (pods, _) = generator
            .generate_pods(&steps, &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        assert_eq!(pods.len(), 1);
    }

    #[test]
    fn test_best_effort_steps_are_tracked_when_allowed() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let mut generator = generator(&config, &params, &resolved);
        let mut lenient = step("teardown");
        lenient.best_effort = true;
        let steps = vec![lenient];

        let (_, best_effort) = generator
            .generate_pods(&steps, &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        assert!(best_effort.is_empty());

        generator.flags.allow_best_effort_post_steps = true;
        let (_, best_effort) = generator
            .generate_pods(&steps, &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        assert!(best_effort.contains("e2e-teardown"));
    }

    #[test]
    fn test_shm_request_becomes_memory_volume() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut shm_step = step("heavy");
        shm_step.resources = ResourceRequest {
            requests: BTreeMap::from([
                ("cpu".to_string(), "100m".to_string()),
                (SHM_RESOURCE.to_string(), "2G".to_string()),
            ]),
            limits: BTreeMap::from([(SHM_RESOURCE.to_string(), "2G".to_string())]),
        };

        let (pods, _) = generator
            .generate_pods(&[shm_step], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let main = container(pod, CONTAINER_NAME);
        let resources = main.resources.as_ref().unwrap();
        assert!(!resources.requests.as_ref().unwrap().contains_key(SHM_RESOURCE));
        assert!(resources.limits.is_none());

        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let dshm = volumes.iter().find(|v| v.name == "dshm").unwrap();
        let source = dshm.empty_dir.as_ref().unwrap();
        assert_eq!(source.medium.as_deref(), Some("Memory"));
        assert_eq!(source.size_limit, Some(Quantity("2G".to_string())));
        assert!(main
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "dshm" && m.mount_path == SHM_MOUNT_PATH));
    }

    #[test]
    fn test_invalid_resources_are_aggregated_across_steps() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut bad0 = step("bad0");
        bad0.resources.requests.insert("cpu".to_string(), "not-a-quantity".to_string());
        let mut bad1 = step("bad1");
        bad1.resources.limits.insert("memory".to_string(), "4X".to_string());

        let err = generator
            .generate_pods(&[bad0, bad1], &[], &[], &[], GeneratePodOptions::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bad0"));
        assert!(message.contains("bad1"));
    }

    #[test]
    fn test_inline_commands_get_strict_mode_prefix() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let main = container(&pods[0], CONTAINER_NAME);
        // the wrapper moved the original command into args
        let args = main.args.as_ref().unwrap();
        assert_eq!(args[0], "/bin/bash");
        assert_eq!(args[1], "-c");
        assert!(args[2].starts_with(COMMAND_PREFIX));
        assert!(args[2].ends_with("echo hello"));
        assert_eq!(
            main.command.as_ref().unwrap()[0],
            "/tmp/entrypoint-wrapper/entrypoint-wrapper"
        );
    }

    #[test]
    fn test_run_as_script_mounts_command_config_map() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut script_step = step("install");
        script_step.run_as_script = true;
        let (pods, _) = generator
            .generate_pods(&[script_step], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let main = container(pod, CONTAINER_NAME);
        let args = main.args.as_ref().unwrap();
        assert_eq!(args[0], format!("{COMMAND_SCRIPT_MOUNT_PATH}/install"));
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let script = volumes.iter().find(|v| v.name == "commands-script").unwrap();
        assert_eq!(script.config_map.as_ref().unwrap().name, "e2e-commands");
    }

    #[test]
    fn test_standard_env_and_shared_dir() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let (pods, _) = generator
            .generate_pods(
                &[step("run")],
                &[env_var("CUSTOM", "value")],
                &[],
                &[],
                GeneratePodOptions::default(),
            )
            .unwrap();
        let main = container(&pods[0], CONTAINER_NAME);
        assert_eq!(env_value(main, "NAMESPACE"), Some("ci-op-1234"));
        assert_eq!(env_value(main, "JOB_NAME_SAFE"), Some("e2e"));
        assert_eq!(env_value(main, "CUSTOM"), Some("value"));
        assert_eq!(env_value(main, SHARED_DIR_ENV), Some(SHARED_DIR_MOUNT_PATH));
        // without a claim, admin credentials come from the shared dir
        assert_eq!(
            env_value(main, "KUBECONFIG"),
            Some("/var/run/secrets/ci.conductor.dev/multi-stage/kubeconfig")
        );
    }

    #[test]
    fn test_step_parameters_respect_test_environment() {
        let mut config = config();
        config
            .environment
            .insert("PROVIDER".to_string(), "gcp".to_string());
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut with_params = step("run");
        with_params.env = vec![
            StepParameter {
                name: "PROVIDER".to_string(),
                default: Some("aws".to_string()),
            },
            StepParameter {
                name: "REGION".to_string(),
                default: Some("us-east-1".to_string()),
            },
        ];
        let (pods, _) = generator
            .generate_pods(&[with_params], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let main = container(&pods[0], CONTAINER_NAME);
        assert_eq!(env_value(main, "PROVIDER"), Some("gcp"));
        assert_eq!(env_value(main, "REGION"), Some("us-east-1"));
    }

    #[test]
    fn test_dependency_env_resolution_and_errors() {
        let config = config();
        let params = StaticParams::with([("IMAGE_STABLE_INSTALLER", "registry/installer@sha256:abc")]);
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut with_deps = step("run");
        with_deps.dependencies = vec![
            crate::api::StepDependency {
                name: "installer".to_string(),
                env: "INSTALLER_IMAGE".to_string(),
                pull_spec: None,
            },
            crate::api::StepDependency {
                name: "direct".to_string(),
                env: "DIRECT_IMAGE".to_string(),
                pull_spec: Some("quay.io/org/direct:latest".to_string()),
            },
        ];
        let (pods, _) = generator
            .generate_pods(&[with_deps.clone()], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let main = container(&pods[0], CONTAINER_NAME);
        assert_eq!(
            env_value(main, "INSTALLER_IMAGE"),
            Some("registry/installer@sha256:abc")
        );
        assert_eq!(env_value(main, "DIRECT_IMAGE"), Some("quay.io/org/direct:latest"));

        // an undeclared dependency parameter is a generation error
        let empty = StaticParams::default();
        let generator = PodGenerator {
            params: &empty,
            ..generator
        };
        let err = generator
            .generate_pods(&[with_deps], &[], &[], &[], GeneratePodOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("could not determine image pull spec"));
    }

    #[test]
    fn test_cluster_profile_layers_volume_and_env() {
        let mut config = config();
        config.cluster_profile = Some("aws-dev".to_string());
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let main = container(pod, CONTAINER_NAME);
        assert_eq!(env_value(main, CLUSTER_TYPE_ENV), Some("aws"));
        assert_eq!(env_value(main, CLUSTER_PROFILE_DIR_ENV), Some(CLUSTER_PROFILE_MOUNT_PATH));
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let profile = volumes.iter().find(|v| v.name == PROFILE_VOLUME_NAME).unwrap();
        assert_eq!(
            profile.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("e2e-cluster-profile")
        );
    }

    #[test]
    fn test_cli_injector_adds_init_container() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut with_cli = step("run");
        with_cli.cli = Some("latest".to_string());
        let (pods, _) = generator
            .generate_pods(&[with_cli], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let inits = pod.spec.as_ref().unwrap().init_containers.as_ref().unwrap();
        let injector = inits.iter().find(|c| c.name == "inject-cli").unwrap();
        assert_eq!(injector.image.as_deref(), Some("stable:cli"));
        let main = container(pod, CONTAINER_NAME);
        assert_eq!(env_value(main, CLI_DIR_ENV), Some(CLI_MOUNT_PATH));
    }

    #[test]
    fn test_claim_params_resolve_censor_mounts() {
        let mut config = config();
        config.cluster_claim = Some(crate::api::ClusterClaim {
            product: "ocp".to_string(),
            version: "4.19".to_string(),
            cloud: "aws".to_string(),
            owner: "ci".to_string(),
            timeout_seconds: None,
        });
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let censor_mounts = vec![
            volume_mount("censor-0", "/secrets/hive-admin-kubeconfig-e2e"),
            volume_mount("censor-1", "/secrets/hive-admin-password-e2e"),
        ];
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &censor_mounts, GeneratePodOptions::default())
            .unwrap();
        let main = container(&pods[0], CONTAINER_NAME);
        assert_eq!(
            env_value(main, "KUBECONFIG"),
            Some("/secrets/hive-admin-kubeconfig-e2e/kubeconfig")
        );
        assert_eq!(
            env_value(main, "KUBEADMIN_PASSWORD_FILE"),
            Some("/secrets/hive-admin-password-e2e/password")
        );

        // missing censor mounts are a generation error
        let err = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("failed to find mount path"));
    }

    #[test]
    fn test_credentials_mount_as_secret_volumes() {
        let config = config();
        let params = StaticParams::default();
        let mut resolved = HashMap::new();
        resolved.insert(
            "run".to_string(),
            vec![
                ResolvedCredential {
                    collection: "team".to_string(),
                    group: "aws".to_string(),
                    field: "access-key".to_string(),
                    alias: None,
                    mount_path: "/secrets/aws".to_string(),
                },
                ResolvedCredential {
                    collection: "team".to_string(),
                    group: "aws".to_string(),
                    field: "secret-key".to_string(),
                    alias: None,
                    mount_path: "/secrets/aws".to_string(),
                },
            ],
        );
        let generator = generator(&config, &params, &resolved);
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let credential_volumes: Vec<_> = volumes.iter().filter(|v| v.name == "team-aws").collect();
        // two fields of one (collection, group) share one secret volume
        assert_eq!(credential_volumes.len(), 1);
        assert_eq!(
            credential_volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("team-aws")
        );
    }

    #[test]
    fn test_credentials_mount_as_csi_volumes_when_enabled() {
        let config = config();
        let params = StaticParams::default();
        let mut resolved = HashMap::new();
        resolved.insert(
            "run".to_string(),
            vec![ResolvedCredential {
                collection: "team".to_string(),
                group: "aws".to_string(),
                field: "access-key".to_string(),
                alias: None,
                mount_path: "/secrets/aws".to_string(),
            }],
        );
        let mut generator = generator(&config, &params, &resolved);
        generator.enable_csi_driver = true;
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let csi_volume = volumes.iter().find(|v| v.csi.is_some()).unwrap();
        let source = csi_volume.csi.as_ref().unwrap();
        assert_eq!(source.driver, CSI_DRIVER_NAME);
        assert_eq!(source.read_only, Some(true));
        assert!(source
            .volume_attributes
            .as_ref()
            .unwrap()
            .get("secretProviderClass")
            .unwrap()
            .ends_with("-spc"));
    }

    #[test]
    fn test_vpn_adds_sidecar_wait_args_and_security_contexts() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let vpn = VpnConfig {
            image: "registry.example.com/vpn:latest".to_string(),
            commands: "openvpn --config client.ovpn".to_string(),
            wait_timeout: Some(600),
            namespace_uid: 1008050000,
        };
        let mut generator = generator(&config, &params, &resolved);
        generator.vpn = Some(&vpn);
        let (pods, _) = generator
            .generate_pods(&[step("run")], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let pod = &pods[0];

        let sidecar = container(pod, VPN_CONTAINER_NAME);
        assert_eq!(sidecar.image.as_deref(), Some("registry.example.com/vpn:latest"));
        let sidecar_context = sidecar.security_context.as_ref().unwrap();
        assert_eq!(sidecar_context.run_as_user, Some(0));
        assert!(sidecar_context
            .capabilities
            .as_ref()
            .unwrap()
            .add
            .as_ref()
            .unwrap()
            .contains(&"NET_ADMIN".to_string()));

        let main = container(pod, CONTAINER_NAME);
        let args = main.args.as_ref().unwrap();
        assert_eq!(&args[..4], &["--wait-for-file", VPN_READY_FILE, "--wait-timeout", "600s"]);
        let main_context = main.security_context.as_ref().unwrap();
        assert_eq!(main_context.run_as_non_root, Some(true));
        assert_eq!(main_context.run_as_user, Some(1008050000));

        // init containers are pinned too
        for init in pod.spec.as_ref().unwrap().init_containers.as_ref().unwrap() {
            assert_eq!(
                init.security_context.as_ref().unwrap().run_as_user,
                Some(1008050000)
            );
        }
    }

    #[test]
    fn test_observer_pods_are_generated_like_steps() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let observers = vec![Observer {
            name: "watcher".to_string(),
            from: Some("cli".to_string()),
            from_image: None,
            commands: "sleep infinity".to_string(),
            resources: ResourceRequest::default(),
        }];
        let pods = generator.generate_observer_pods(&observers, &[], &[]).unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("e2e-watcher"));
    }

    #[test]
    fn test_dns_overrides() {
        let config = config();
        let params = StaticParams::default();
        let resolved = HashMap::new();
        let generator = generator(&config, &params, &resolved);
        let mut with_dns = step("run");
        with_dns.dns = Some(crate::api::DnsConfig {
            nameservers: vec!["10.0.0.2".to_string()],
            searches: vec!["internal.example.com".to_string()],
        });
        let (pods, _) = generator
            .generate_pods(&[with_dns], &[], &[], &[], GeneratePodOptions::default())
            .unwrap();
        let spec = pods[0].spec.as_ref().unwrap();
        assert_eq!(spec.dns_policy.as_deref(), Some("None"));
        let dns = spec.dns_config.as_ref().unwrap();
        assert_eq!(dns.nameservers.as_ref().unwrap()[0], "10.0.0.2");
    }
}
