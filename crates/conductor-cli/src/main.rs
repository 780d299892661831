// Entry point for the Conductor CLI. Loads a run configuration, builds the
// cluster client, and drives one multi-stage test to completion. Ctrl-C
// cancels the run; the engine then cleans up its pods and still executes
// the post phase.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use conductor_engine::cluster::KubeClusterClient;
use conductor_engine::MultiStageTest;

mod run_config;

use run_config::{ConfiguredParams, RunConfig};

/// Command-line arguments for the conductor binary.
#[derive(Parser, Debug)]
#[command(name = "conductor", about = "Run a multi-stage CI test on a cluster")]
struct Args {
    /// Path to the run configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the namespace from the run configuration.
    #[arg(long)]
    namespace: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async move { run(args).await });
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    conductor_common::logging::init(args.json_logs);

    match execute(args).await {
        Ok(()) => {
            tracing::info!("Test succeeded.");
            0
        }
        Err(e) => {
            tracing::error!("Test failed: {e:#}");
            1
        }
    }
}

async fn execute(args: Args) -> Result<()> {
    let mut config = RunConfig::load(&args.config)?;
    if let Some(namespace) = args.namespace {
        config.test.namespace = namespace;
    }
    let run_id = uuid::Uuid::new_v4();
    tracing::info!(
        "Starting run {run_id} of test {} in namespace {}",
        config.test.name,
        config.test.namespace
    );

    let client = KubeClusterClient::from_default_env()
        .await
        .context("failed to connect to the cluster")?;
    let params = Arc::new(ConfiguredParams::new(config.parameters));

    let mut test = MultiStageTest::new(config.test, Arc::new(client), params)?
        .with_store_settings(config.store)
        .with_csi_driver(config.enable_csi_driver);
    if let Some(bundles) = config.bundles {
        test = test.with_bundle_config(bundles);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling the run...");
                cancel.cancel();
            }
        });
    }

    let result = test.run(cancel).await;

    for report in test.phase_reports() {
        match report.failure_output {
            Some(failure) => {
                tracing::warn!("{}: failed after {:?}: {failure}", report.name, report.duration)
            }
            None => tracing::info!("{}: succeeded after {:?}", report.name, report.duration),
        }
    }
    for detail in test.sub_steps() {
        let verb = if detail.failed { "failed" } else { "succeeded" };
        tracing::info!(
            "step {} {verb} after {:?} ({} objects written)",
            detail.name,
            detail.duration,
            detail.manifests.len()
        );
    }

    result.map_err(Into::into)
}
