// The phase executor: drives provisioning, observers, and the ordered pre /
// test / post phases of one multi-stage test. Pre and test run under the
// fail-fast flag; post always runs, in a cancellation scope of its own, so
// cleanup steps survive outer cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::{EnvVar, Pod, Secret, SecretVolumeSource, Volume, VolumeMount};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conductor_common::constants::{
    MULTI_STAGE_TEST_LABEL, SERVICE_ACCOUNT_NAME_ANNOTATION, SKIP_CENSORING_LABEL,
};

use crate::api::{
    release_image_env, BundleConfig, Phase, PhaseReport, ResolvedCredential, RunFlags,
    SecretStoreSettings, StepDefinition, StepDetail, TestConfiguration, IMAGE_FORMAT_ENV,
    INITIAL_RELEASE, IP_POOL_LEASE_ENV, LATEST_RELEASE,
};
use crate::client::{
    ClusterClient, ClusterError, ObjectRef, ParameterSource, RecordingClient, SecretStoreClient,
    WaitOptions,
};
use crate::credentials::{
    resolve_credential_references, validate_no_group_collisions_on_mount_path,
    DiscoveredFieldsCache,
};
use crate::csi::{self, CSI_DRIVER_NAME};
use crate::errors::{aggregate, OrchestratorError};
use crate::generate::{censor_secret_mount_path, env_var, GeneratePodOptions, PodGenerator};
use crate::observe::ObserverCoordinator;
use crate::provision;
use crate::vpn::{self, VpnConfig};

/// How long to wait for a deleted pod to disappear during cleanup.
const CLEANUP_DELETION_WAIT: Duration = Duration::from_secs(300);

/// One multi-stage test, ready to run against a cluster.
///
/// Construction validates the configuration; `run` is the single produced
/// entry point. Structured per-step and per-phase records are available
/// afterwards regardless of the outcome.
pub struct MultiStageTest {
    config: TestConfiguration,
    client: Arc<RecordingClient>,
    params: Arc<dyn ParameterSource>,
    secret_store: Option<Arc<dyn SecretStoreClient>>,
    bundle_config: Option<BundleConfig>,
    store_settings: SecretStoreSettings,
    enable_csi_driver: bool,
    flags: RunFlags,
    vpn: Option<VpnConfig>,
    resolved_credentials: HashMap<String, Vec<ResolvedCredential>>,
    discovered_fields: DiscoveredFieldsCache,
    sub_steps: Arc<Mutex<Vec<StepDetail>>>,
    phase_reports: Mutex<Vec<PhaseReport>>,
}

impl std::fmt::Debug for MultiStageTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiStageTest")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MultiStageTest {
    /// Validate the configuration and build a runnable test.
    ///
    /// A cluster claim and a cluster profile are two mutually exclusive ways
    /// of obtaining a test environment; configuring both is rejected here,
    /// before any cluster object is touched.
    pub fn new(
        config: TestConfiguration,
        client: Arc<dyn ClusterClient>,
        params: Arc<dyn ParameterSource>,
    ) -> Result<Self, OrchestratorError> {
        if config.cluster_profile.is_some() && config.cluster_claim.is_some() {
            return Err(OrchestratorError::Configuration(
                "cannot set both cluster_profile and cluster_claim in a test".to_string(),
            ));
        }
        let flags = RunFlags {
            fail_fast: false,
            has_prev_errs: false,
            allow_skip_on_success: config.allow_skip_on_success,
            allow_best_effort_post_steps: config.allow_best_effort_post_steps,
        };
        Ok(MultiStageTest {
            config,
            client: Arc::new(RecordingClient::new(client)),
            params,
            secret_store: None,
            bundle_config: None,
            store_settings: SecretStoreSettings::default(),
            enable_csi_driver: false,
            flags,
            vpn: None,
            resolved_credentials: HashMap::new(),
            discovered_fields: DiscoveredFieldsCache::new(),
            sub_steps: Arc::new(Mutex::new(Vec::new())),
            phase_reports: Mutex::new(Vec::new()),
        })
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStoreClient>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn with_bundle_config(mut self, config: BundleConfig) -> Self {
        self.bundle_config = Some(config);
        self
    }

    pub fn with_store_settings(mut self, settings: SecretStoreSettings) -> Self {
        self.store_settings = settings;
        self
    }

    pub fn with_csi_driver(mut self, enabled: bool) -> Self {
        self.enable_csi_driver = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Per-step execution records, in completion order.
    pub fn sub_steps(&self) -> Vec<StepDetail> {
        self.sub_steps.lock().clone()
    }

    /// Per-phase summary records.
    pub fn phase_reports(&self) -> Vec<PhaseReport> {
        self.phase_reports.lock().clone()
    }

    /// Every object written on behalf of this test.
    pub fn written_objects(&self) -> Vec<ObjectRef> {
        self.client.objects()
    }

    /// Run the test to completion. The returned error, when any, is the
    /// aggregate of all unrecovered failures across the phases; individual
    /// step and observer outcomes remain visible in the structured records
    /// either way.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        info!("Running multi-stage test {}", self.config.name);
        if self.config.cluster_profile.is_some() {
            self.load_profile_data().await?;
        }
        self.resolve_all_credentials().await?;
        let env = self.environment()?;

        provision::create_shared_dir_secret(self.client.as_ref(), &self.config)
            .await
            .map_err(|e| e.context("failed to create secret"))?;
        let resolved_flat: Vec<ResolvedCredential> = self
            .resolved_credentials
            .values()
            .flatten()
            .cloned()
            .collect();
        if self.enable_csi_driver {
            provision::create_secret_provider_classes(
                self.client.as_ref(),
                &self.config,
                &resolved_flat,
                &self.store_settings,
            )
            .await
            .map_err(|e| e.context("failed to create SecretProviderClass objects"))?;
        } else {
            provision::copy_credential_secrets(self.client.as_ref(), &self.config, &resolved_flat)
                .await
                .map_err(|e| e.context("failed to create credentials"))?;
        }
        provision::create_command_config_map(self.client.as_ref(), &self.config)
            .await
            .map_err(|e| e.context("failed to create command configmap"))?;
        provision::setup_rbac(self.client.as_ref(), &self.config, self.vpn.is_some())
            .await
            .map_err(|e| e.context("failed to create RBAC objects"))?;
        if let Some(vpn_config) = self.vpn.as_mut() {
            vpn_config.namespace_uid =
                vpn::namespace_uid(self.client.as_ref(), &self.config.namespace)
                    .await
                    .map_err(|e| e.context("failed to determine namespace UID range"))?;
        }

        let (mut censor_volumes, mut censor_mounts) = self.secrets_for_censoring().await?;
        if self.enable_csi_driver {
            self.add_credentials_to_censoring(&resolved_flat, &mut censor_volumes, &mut censor_mounts);
        }

        // If the observer pods cannot even be generated there is no reason
        // to run the job.
        let observer_pods = self.generator().generate_observer_pods(
            &self.config.observers,
            &censor_volumes,
            &censor_mounts,
        )?;
        let coordinator = ObserverCoordinator::start(
            self.client.clone(),
            Arc::clone(&self.sub_steps),
            &self.config.name,
            observer_pods,
            &cancel,
        )
        .await;

        let mut errs = Vec::new();
        self.flags.fail_fast = true;
        if let Err(err) = self
            .run_phase(&cancel, Phase::Pre, &env, &censor_volumes, &censor_mounts)
            .await
        {
            errs.push(err.context(format!("{:?} pre steps failed", self.config.name)));
        } else if let Err(err) = self
            .run_phase(&cancel, Phase::Test, &env, &censor_volumes, &censor_mounts)
            .await
        {
            errs.push(err.context(format!("{:?} test steps failed", self.config.name)));
        }
        // signal to observers that we're tearing down
        coordinator.begin_teardown();
        self.flags.fail_fast = false;
        // post runs in its own cancellation scope: outer cancellation must
        // not prevent cleanup steps from running
        let post_cancel = CancellationToken::new();
        if let Err(err) = self
            .run_phase(&post_cancel, Phase::Post, &env, &censor_volumes, &censor_mounts)
            .await
        {
            errs.push(err.context(format!("{:?} post steps failed", self.config.name)));
        }
        // wait for the observers to finish so their records are complete
        coordinator.wait().await;
        aggregate(errs)
    }

    /// Fetch the cluster profile secret, both to guarantee it was imported
    /// into the namespace and to read the VPN configuration out of it.
    async fn load_profile_data(&mut self) -> Result<(), OrchestratorError> {
        let name = self.config.profile_secret_name();
        let secret: Secret = self
            .client
            .get_secret(&self.config.namespace, &name)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "could not get cluster profile secret {name:?}"
                ))
            })?;
        self.vpn = vpn::read_vpn_config(&secret)
            .map_err(|e| e.context("failed to read VPN configuration from cluster profile"))?;
        Ok(())
    }

    /// Resolve every step's credential references once, caching discovery
    /// results for the whole run, then validate the combined set.
    async fn resolve_all_credentials(&mut self) -> Result<(), OrchestratorError> {
        let steps: Vec<(String, Vec<crate::api::CredentialReference>)> = self
            .config
            .all_steps()
            .filter(|step| !step.credentials.is_empty())
            .map(|step| (step.name.clone(), step.credentials.clone()))
            .collect();
        let mut all = Vec::new();
        for (step_name, references) in steps {
            let resolved = resolve_credential_references(
                &references,
                self.bundle_config.as_ref(),
                self.secret_store.as_deref(),
                &self.discovered_fields,
            )
            .await
            .map_err(|e| {
                e.context(format!("failed to resolve credentials for step {step_name}"))
            })?;
            all.extend(resolved.iter().cloned());
            self.resolved_credentials.insert(step_name, resolved);
        }
        validate_no_group_collisions_on_mount_path(&all)
    }

    /// Environment shared by every step of the test, assembled from the
    /// upstream parameter source.
    fn environment(&self) -> Result<Vec<EnvVar>, OrchestratorError> {
        let mut ret = Vec::new();
        for lease in &self.config.leases {
            let value = self
                .params
                .get(&lease.env)
                .map_err(|e| OrchestratorError::Parameter(e.to_string()))?;
            ret.push(env_var(&lease.env, &value));
        }
        for release in [INITIAL_RELEASE, LATEST_RELEASE] {
            let name = format!("ORIGINAL_{}", release_image_env(release));
            if let Ok(value) = self.params.get(&name) {
                if !value.is_empty() {
                    ret.push(env_var(&name, &value));
                }
            }
        }
        if self.config.cluster_profile.is_some() {
            for name in [release_image_env(LATEST_RELEASE), IMAGE_FORMAT_ENV.to_string()] {
                let value = self
                    .params
                    .get(&name)
                    .map_err(|e| OrchestratorError::Parameter(e.to_string()))?;
                ret.push(env_var(&name, &value));
            }
            if self.config.cluster_type().as_deref() == Some("aws") {
                let value = self
                    .params
                    .get(IP_POOL_LEASE_ENV)
                    .map_err(|e| OrchestratorError::Parameter(e.to_string()))?;
                ret.push(env_var(IP_POOL_LEASE_ENV, &value));
            }
        }
        Ok(ret)
    }

    /// The censoring volumes handed to every pod: all secrets in the
    /// namespace except the shared-state secret and service account tokens.
    async fn secrets_for_censoring(
        &self,
    ) -> Result<(Vec<Volume>, Vec<VolumeMount>), OrchestratorError> {
        let secrets = self
            .client
            .list_secrets(&self.config.namespace)
            .await
            .map_err(|e| {
                OrchestratorError::from(e)
                    .context("could not list secrets to determine content to censor")
            })?;
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (i, secret) in secrets
            .iter()
            .filter(|s| {
                let labeled_skip = s
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.contains_key(SKIP_CENSORING_LABEL));
                let account_token = s
                    .metadata
                    .annotations
                    .as_ref()
                    .is_some_and(|a| a.contains_key(SERVICE_ACCOUNT_NAME_ANNOTATION));
                !labeled_skip && !account_token
            })
            .enumerate()
        {
            let secret_name = secret.metadata.name.clone().unwrap_or_default();
            let volume_name = format!("censor-{i}");
            volumes.push(Volume {
                name: volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: censor_secret_mount_path(&secret_name),
                ..VolumeMount::default()
            });
        }
        Ok((volumes, mounts))
    }

    /// With CSI delivery there are no copied credential secrets in the
    /// namespace to censor; add one CSI-backed censoring volume per
    /// referenced (collection, group) instead.
    fn add_credentials_to_censoring(
        &self,
        resolved: &[ResolvedCredential],
        volumes: &mut Vec<Volume>,
        mounts: &mut Vec<VolumeMount>,
    ) {
        for (i, ((_, group), creds)) in csi::censor_credential_groups(resolved).iter().enumerate() {
            let volume_name = format!("censor-cred-{i}");
            let class = csi::provider_class_name(&self.config.namespace, creds);
            let mut attributes = std::collections::BTreeMap::new();
            attributes.insert("secretProviderClass".to_string(), class);
            volumes.push(Volume {
                name: volume_name.clone(),
                csi: Some(k8s_openapi::api::core::v1::CSIVolumeSource {
                    driver: CSI_DRIVER_NAME.to_string(),
                    read_only: Some(true),
                    volume_attributes: Some(attributes),
                    ..k8s_openapi::api::core::v1::CSIVolumeSource::default()
                }),
                ..Volume::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: censor_secret_mount_path(group),
                ..VolumeMount::default()
            });
        }
    }

    fn generator(&self) -> PodGenerator<'_> {
        PodGenerator {
            config: &self.config,
            flags: self.flags,
            params: self.params.as_ref(),
            vpn: self.vpn.as_ref(),
            enable_csi_driver: self.enable_csi_driver,
            resolved_credentials: &self.resolved_credentials,
        }
    }

    fn phase_steps(&self, phase: Phase) -> &[StepDefinition] {
        match phase {
            Phase::Pre => &self.config.pre,
            Phase::Test => &self.config.test,
            Phase::Post => &self.config.post,
        }
    }

    /// Run one phase: generate its pods, execute them in order, and clean up
    /// labeled pods if the phase was cancelled. Any failure marks the run as
    /// having previous errors for the skip-on-success logic.
    async fn run_phase(
        &mut self,
        cancel: &CancellationToken,
        phase: Phase,
        env: &[EnvVar],
        censor_volumes: &[Volume],
        censor_mounts: &[VolumeMount],
    ) -> Result<(), OrchestratorError> {
        let timer = Instant::now();
        info!("Running multi-stage phase {phase}");
        let steps = self.phase_steps(phase).to_vec();
        let generated = self.generator().generate_pods(
            &steps,
            env,
            censor_volumes,
            censor_mounts,
            GeneratePodOptions::default(),
        );
        let (pods, best_effort) = match generated {
            Ok(generated) => generated,
            Err(err) => {
                self.flags.has_prev_errs = true;
                self.record_phase(phase, timer.elapsed(), Some(&err));
                return Err(err);
            }
        };

        let mut errs = Vec::new();
        if let Err(err) = self.run_pods(cancel, pods, &best_effort).await {
            errs.push(err);
        }
        if cancel.is_cancelled() {
            info!(
                "cleanup: deleting pods with label {}={}",
                MULTI_STAGE_TEST_LABEL, self.config.name
            );
            if let Err(err) = self.cleanup_pods().await {
                errs.push(err);
            }
            errs.push(OrchestratorError::Cancelled);
        }

        let result = aggregate(errs);
        let duration = timer.elapsed();
        self.record_phase(phase, duration, result.as_ref().err());
        let verb = if result.is_ok() { "succeeded" } else { "failed" };
        info!("Step phase {phase} {verb} after {}s.", duration.as_secs());
        if result.is_err() {
            self.flags.has_prev_errs = true;
        }
        result
    }

    async fn run_pods(
        &self,
        cancel: &CancellationToken,
        pods: Vec<Pod>,
        best_effort: &HashSet<String>,
    ) -> Result<(), OrchestratorError> {
        let mut errs = Vec::new();
        for pod in pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let result = run_pod(
                self.client.clone(),
                Arc::clone(&self.sub_steps),
                self.config.name.clone(),
                pod,
                WaitOptions::default(),
                cancel.clone(),
            )
            .await;
            let Err(err) = result else { continue };
            if best_effort.contains(&pod_name) {
                info!("Pod {pod_name} is running in best-effort mode, ignoring the failure...");
                continue;
            }
            errs.push(err);
            if self.flags.fail_fast {
                break;
            }
        }
        aggregate(errs)
    }

    /// Best-effort cleanup after cancellation: delete every pod carrying the
    /// test's selector label that is not already terminal or being deleted,
    /// and wait for each deletion to be confirmed. One pod's failure does
    /// not stop the attempts on the others.
    async fn cleanup_pods(&self) -> Result<(), OrchestratorError> {
        let selector = format!("{}={}", MULTI_STAGE_TEST_LABEL, self.config.name);
        let pods = self
            .client
            .list_pods(&self.config.namespace, &selector)
            .await
            .map_err(|e| {
                OrchestratorError::from(e)
                    .context(format!("failed to list pods with label {selector}"))
            })?;
        let mut errs = Vec::new();
        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let terminal = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
            if terminal || pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            match self.client.delete_pod(&self.config.namespace, &name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    errs.push(
                        OrchestratorError::from(err)
                            .context(format!("failed to delete pod {name}")),
                    );
                    continue;
                }
            }
            if let Err(err) = self
                .client
                .wait_for_pod_deletion(&self.config.namespace, &name, CLEANUP_DELETION_WAIT)
                .await
            {
                errs.push(
                    OrchestratorError::from(err)
                        .context(format!("failed to wait for deletion of pod {name}")),
                );
            }
        }
        aggregate(errs)
    }

    fn record_phase(&self, phase: Phase, duration: Duration, err: Option<&OrchestratorError>) {
        self.phase_reports.lock().push(PhaseReport {
            name: format!("Run multi-stage test {phase} phase"),
            duration,
            output: format!("The collected steps of multi-stage phase {phase}."),
            failure_output: err.map(|e| e.to_string()),
        });
    }
}

/// Execute one pod to a terminal state and record the outcome.
///
/// Shared by the phase executor and the observer coordinator; `records` is
/// the lock-protected collection both append to. A per-call recording client
/// captures the objects this pod's execution wrote.
pub(crate) async fn run_pod(
    client: Arc<dyn ClusterClient>,
    records: Arc<Mutex<Vec<StepDetail>>>,
    test_name: String,
    pod: Pod,
    opts: WaitOptions,
    cancel: CancellationToken,
) -> Result<(), OrchestratorError> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let step_client = Arc::new(RecordingClient::new(client));

    create_or_restart_pod(step_client.as_ref(), &pod)
        .await
        .map_err(|e| e.context(format!("failed to create or restart {name} pod")))?;

    wait_and_record(step_client, records, test_name, pod, opts, cancel).await
}

/// Wait for an already-created pod and append its record. Split from
/// `run_pod` so the observer coordinator can create pods up front, before
/// the teardown watcher could possibly fire.
pub(crate) async fn wait_and_record(
    step_client: Arc<RecordingClient>,
    records: Arc<Mutex<Vec<StepDetail>>>,
    test_name: String,
    pod: Pod,
    opts: WaitOptions,
    cancel: CancellationToken,
) -> Result<(), OrchestratorError> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let started_at = Utc::now();
    let timer = Instant::now();
    info!("Running step {name}.");

    let completion = step_client
        .wait_for_pod_completion(&namespace, &name, opts, &cancel)
        .await;
    let finished_at = Utc::now();
    let duration = timer.elapsed();

    let (failed, failure) = match &completion {
        Ok(completion) if completion.failed => {
            let mut status = "failed".to_string();
            if completion.reason.as_deref() == Some("DeadlineExceeded") {
                status = "exceeded the configured timeout".to_string();
                if let Some(deadline) = completion
                    .pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.active_deadline_seconds)
                {
                    status = format!("{status} activeDeadlineSeconds={deadline}");
                }
            }
            (
                true,
                Some(OrchestratorError::Execution(format!(
                    "{test_name:?} pod {name:?} {status}"
                ))),
            )
        }
        Ok(_) => (false, None),
        Err(ClusterError::Cancelled) => (true, Some(OrchestratorError::Cancelled)),
        Err(err) => (
            true,
            Some(OrchestratorError::Execution(format!(
                "{test_name:?} pod {name:?} failed: {err}"
            ))),
        ),
    };

    let verb = if failed { "failed" } else { "succeeded" };
    info!("Step {name} {verb} after {}s.", duration.as_secs());
    records.lock().push(StepDetail {
        name: name.clone(),
        description: format!("Run pod {name}"),
        started_at,
        finished_at,
        duration,
        failed,
        manifests: step_client.objects(),
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Create a pod, replacing any leftover instance from a previous attempt.
pub(crate) async fn create_or_restart_pod(
    client: &dyn ClusterClient,
    pod: &Pod,
) -> Result<(), OrchestratorError> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    if client.get_pod(&namespace, &name).await?.is_some() {
        debug!("Deleting leftover pod {name} before recreation");
        match client.delete_pod(&namespace, &name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        client
            .wait_for_pod_deletion(&namespace, &name, CLEANUP_DELETION_WAIT)
            .await?;
    }
    match client.create_pod(pod).await {
        Ok(_) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterClaim, StepDefinition};
    use crate::testing::{FakeCluster, StaticParams};

    fn step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            from: Some("cli".to_string()),
            from_image: None,
            commands: format!("echo {name}"),
            run_as_script: false,
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
        }
    }

    fn config() -> TestConfiguration {
        TestConfiguration {
            name: "e2e".to_string(),
            namespace: "ci-op-1234".to_string(),
            job_name: "pull-ci-org-repo-branch-e2e".to_string(),
            pre: vec![step("pre0"), step("pre1")],
            test: vec![step("test0"), step("test1")],
            post: vec![step("post0")],
            ..TestConfiguration::default()
        }
    }

    fn build(cluster: &Arc<FakeCluster>, config: TestConfiguration) -> MultiStageTest {
        MultiStageTest::new(
            config,
            Arc::clone(cluster) as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_phases_run_in_order() {
        let cluster = Arc::new(FakeCluster::new());
        let mut test = build(&cluster, config());
        test.run(CancellationToken::new()).await.unwrap();
        assert_eq!(
            cluster.created_pod_names(),
            vec!["e2e-pre0", "e2e-pre1", "e2e-test0", "e2e-test1", "e2e-post0"]
        );
        let reports = test.phase_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.failure_output.is_none()));
        // each step record lists the pod it wrote
        let details = test.sub_steps();
        assert_eq!(details.len(), 5);
        assert!(details[0]
            .manifests
            .iter()
            .any(|o| o.kind == "Pod" && o.name == "e2e-pre0"));
        // provisioning objects are visible on the run-wide recorder
        let objects = test.written_objects();
        assert!(objects.iter().any(|o| o.kind == "Secret" && o.name == "e2e"));
        assert!(objects.iter().any(|o| o.kind == "ConfigMap" && o.name == "e2e-commands"));
        assert!(objects.iter().any(|o| o.kind == "ServiceAccount" && o.name == "e2e"));
    }

    #[tokio::test]
    async fn test_pre_failure_short_circuits_but_post_still_runs() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-pre0", "Error");
        let mut test = build(&cluster, config());
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("pre steps failed"));
        // pre short-circuits after the failure, test creates nothing, post
        // still runs
        assert_eq!(cluster.created_pod_names(), vec!["e2e-pre0", "e2e-post0"]);
        let details = test.sub_steps();
        assert!(details.iter().any(|d| d.name == "e2e-pre0" && d.failed));
        assert!(details.iter().any(|d| d.name == "e2e-post0" && !d.failed));
    }

    #[tokio::test]
    async fn test_best_effort_post_failure_does_not_fail_the_run() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-post0", "Error");
        let mut lenient = config();
        lenient.allow_best_effort_post_steps = true;
        lenient.post[0].best_effort = true;
        let mut test = build(&cluster, lenient);
        test.run(CancellationToken::new()).await.unwrap();
        // the underlying failure is still visible in the step record
        assert!(test.sub_steps().iter().any(|d| d.name == "e2e-post0" && d.failed));
    }

    #[tokio::test]
    async fn test_non_best_effort_post_failure_fails_the_run() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-post0", "Error");
        let mut test = build(&cluster, config());
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("post steps failed"));
    }

    #[tokio::test]
    async fn test_post_failure_does_not_stop_remaining_post_steps() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-post0", "Error");
        let mut two_post = config();
        two_post.post.push(step("post1"));
        let mut test = build(&cluster, two_post);
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("post steps failed"));
        // fail-fast is cleared for post: post1 still ran
        assert!(cluster.created_pod_names().contains(&"e2e-post1".to_string()));
    }

    #[tokio::test]
    async fn test_skip_on_success_steps_are_skipped_without_failures() {
        let cluster = Arc::new(FakeCluster::new());
        let mut skippable = config();
        skippable.allow_skip_on_success = true;
        skippable.post[0].optional_on_success = true;
        let mut test = build(&cluster, skippable.clone());
        test.run(CancellationToken::new()).await.unwrap();
        assert!(!cluster.created_pod_names().contains(&"e2e-post0".to_string()));

        // with an earlier failure the optional step runs
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-test0", "Error");
        let mut test = build(&cluster, skippable);
        test.run(CancellationToken::new()).await.unwrap_err();
        assert!(cluster.created_pod_names().contains(&"e2e-post0".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up_and_still_runs_post() {
        let cluster = Arc::new(FakeCluster::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut test = build(&cluster, config());
        let err = test.run(cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        // the interrupted pre pod was deleted by the cleanup pass
        assert!(cluster.deleted_pod_names().contains(&"e2e-pre0".to_string()));
        // post runs in its own cancellation scope
        assert!(cluster.created_pod_names().contains(&"e2e-post0".to_string()));
        assert!(cluster.pod("ci-op-1234", "e2e-post0").is_some());
    }

    #[tokio::test]
    async fn test_observers_run_alongside_and_are_torn_down() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_hang("e2e-watcher");
        let mut observed = config();
        observed.observers = vec![crate::api::Observer {
            name: "watcher".to_string(),
            from: Some("cli".to_string()),
            from_image: None,
            commands: "sleep infinity".to_string(),
            resources: Default::default(),
        }];
        let mut test = build(&cluster, observed);
        test.run(CancellationToken::new()).await.unwrap();
        assert!(cluster.created_pod_names().contains(&"e2e-watcher".to_string()));
        assert!(cluster.deleted_pod_names().contains(&"e2e-watcher".to_string()));
        // the observer's record was collected before run returned
        assert!(test.sub_steps().iter().any(|d| d.name == "e2e-watcher"));
    }

    #[tokio::test]
    async fn test_failing_observer_never_fails_the_run() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-watcher", "Error");
        let mut observed = config();
        observed.observers = vec![crate::api::Observer {
            name: "watcher".to_string(),
            from: Some("cli".to_string()),
            from_image: None,
            commands: "exit 1".to_string(),
            resources: Default::default(),
        }];
        let mut test = build(&cluster, observed);
        test.run(CancellationToken::new()).await.unwrap();
        assert!(test.sub_steps().iter().any(|d| d.name == "e2e-watcher" && d.failed));
    }

    #[tokio::test]
    async fn test_claim_and_profile_are_mutually_exclusive() {
        let cluster = Arc::new(FakeCluster::new());
        let mut both = config();
        both.cluster_profile = Some("aws".to_string());
        both.cluster_claim = Some(ClusterClaim {
            product: "ocp".to_string(),
            version: "4.19".to_string(),
            cloud: "aws".to_string(),
            owner: "ci".to_string(),
            timeout_seconds: None,
        });
        let err = MultiStageTest::new(
            both,
            cluster as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::default()),
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_profile_secret_fails_before_any_pod() {
        let cluster = Arc::new(FakeCluster::new());
        let mut profiled = config();
        profiled.cluster_profile = Some("aws".to_string());
        let mut test = MultiStageTest::new(
            profiled,
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::with([
                ("RELEASE_IMAGE_LATEST", "registry/release:latest"),
                ("IMAGE_FORMAT", "registry/${component}:latest"),
                ("DEFAULT_IP_POOL_LEASE", "pool-1"),
            ])),
        )
        .unwrap();
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("could not get cluster profile secret"));
        assert!(cluster.created_pod_names().is_empty());
    }

    #[tokio::test]
    async fn test_profile_run_with_vpn_configures_sidecar_and_rbac() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_namespace("ci-op-1234", Some("1008050000/10000"));
        cluster.put_secret(
            "ci-op-1234",
            "e2e-cluster-profile",
            &[
                (
                    "vpn.yaml",
                    "image: registry.example.com/vpn:latest\ncommands: vpn.sh\nwait_timeout: 300\n",
                ),
                ("vpn.sh", "openvpn --config client.ovpn\n"),
            ],
        );
        let mut profiled = config();
        profiled.cluster_profile = Some("gcp-dev".to_string());
        let mut test = MultiStageTest::new(
            profiled,
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::with([
                ("RELEASE_IMAGE_LATEST", "registry/release:latest"),
                ("IMAGE_FORMAT", "registry/${component}:latest"),
            ])),
        )
        .unwrap();
        test.run(CancellationToken::new()).await.unwrap();

        let pod = cluster.pod("ci-op-1234", "e2e-pre0").unwrap();
        let spec = pod.spec.unwrap();
        assert!(spec.containers.iter().any(|c| c.name == "vpn-client"));
        let main = spec.containers.iter().find(|c| c.name == "test").unwrap();
        let context = main.security_context.as_ref().unwrap();
        assert_eq!(context.run_as_user, Some(1008050000));
        assert!(cluster.role_binding("ci-op-1234", "e2e-vpn").is_some());
    }

    #[tokio::test]
    async fn test_censoring_volumes_skip_labeled_and_token_secrets() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_secret("ci-op-1234", "team-credentials", &[("token", "hunter2")]);
        cluster.put_labeled_secret(
            "ci-op-1234",
            "uncensored",
            (SKIP_CENSORING_LABEL, "true"),
        );
        let mut test = build(&cluster, config());
        test.run(CancellationToken::new()).await.unwrap();
        let pod = cluster.pod("ci-op-1234", "e2e-pre0").unwrap();
        let volumes = pod.spec.unwrap().volumes.unwrap();
        let censored: Vec<_> = volumes
            .iter()
            .filter_map(|v| v.secret.as_ref().and_then(|s| s.secret_name.clone()))
            .collect();
        assert!(censored.contains(&"team-credentials".to_string()));
        assert!(!censored.contains(&"uncensored".to_string()));
        // the shared-state secret is labeled to skip censoring; it appears
        // only as the shared-dir volume, not as a censor volume
        assert!(!volumes.iter().any(|v| v.name.starts_with("censor-")
            && v.secret.as_ref().and_then(|s| s.secret_name.as_deref()) == Some("e2e")));
    }

    #[tokio::test]
    async fn test_lease_parameters_reach_step_env() {
        let cluster = Arc::new(FakeCluster::new());
        let mut leased = config();
        leased.leases = vec![crate::api::StepLease {
            resource_type: "aws-quota-slice".to_string(),
            env: "LEASED_RESOURCE".to_string(),
            count: 1,
        }];
        let mut test = MultiStageTest::new(
            leased.clone(),
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::with([("LEASED_RESOURCE", "us-east-1")])),
        )
        .unwrap();
        test.run(CancellationToken::new()).await.unwrap();
        let pod = cluster.pod("ci-op-1234", "e2e-pre0").unwrap();
        let main = pod
            .spec
            .unwrap()
            .containers
            .into_iter()
            .find(|c| c.name == "test")
            .unwrap();
        assert!(main
            .env
            .unwrap()
            .iter()
            .any(|e| e.name == "LEASED_RESOURCE" && e.value.as_deref() == Some("us-east-1")));

        // an undeclared lease parameter fails the run before any pod exists
        let cluster = Arc::new(FakeCluster::new());
        let mut test = MultiStageTest::new(
            leased,
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::new(StaticParams::default()),
        )
        .unwrap();
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Parameter(_)));
        assert!(cluster.created_pod_names().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_reason_is_reported() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.script_pod_failure("e2e-test0", "DeadlineExceeded");
        let mut test = build(&cluster, config());
        let err = test.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("exceeded the configured timeout"));
    }
}
