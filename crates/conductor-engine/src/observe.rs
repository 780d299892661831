// Observer coordination. Observers run concurrently with the pre and test
// phases and are torn down by deleting their pods once the test phase
// concludes (or the caller cancels). Observer failures are logged, never
// propagated: an auxiliary process must not fail the run.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::StepDetail;
use crate::client::{ClusterClient, RecordingClient, WaitOptions};
use crate::execute::{create_or_restart_pod, wait_and_record};

/// Lifecycle of one observer, driven by its two cooperating tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct ObserverHandle {
    name: String,
    state: Arc<Mutex<ObserverState>>,
}

/// Runs a set of observer pods until torn down.
///
/// `start` creates every observer pod before returning, so the teardown
/// watcher can never race ahead of a pod that does not exist yet. Two tasks
/// then drive each observer: a deletion watcher that fires on the teardown
/// signal, and a waiter that follows the pod to completion. The teardown
/// token is a child of the caller's cancellation token, so outer
/// cancellation triggers observer deletion as well. `wait` is the join
/// barrier: it resolves only once every observer has reached `Stopped`,
/// guaranteeing the caller can safely collect observer records.
pub struct ObserverCoordinator {
    teardown: CancellationToken,
    handles: Vec<ObserverHandle>,
    tasks: JoinSet<()>,
}

impl ObserverCoordinator {
    pub async fn start(
        client: Arc<dyn ClusterClient>,
        records: Arc<Mutex<Vec<StepDetail>>>,
        test_name: &str,
        pods: Vec<Pod>,
        cancel: &CancellationToken,
    ) -> Self {
        let teardown = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut handles = Vec::with_capacity(pods.len());

        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let state = Arc::new(Mutex::new(ObserverState::Starting));
            handles.push(ObserverHandle {
                name: name.clone(),
                state: Arc::clone(&state),
            });

            let step_client = Arc::new(RecordingClient::new(Arc::clone(&client)));
            if let Err(err) = create_or_restart_pod(step_client.as_ref(), &pod).await {
                warn!(error = %err, "failed to start observer {name}");
                *state.lock() = ObserverState::Stopped;
                continue;
            }

            // Deletion watcher: the teardown signal stops the observer by
            // deleting its pod. Best-effort; a failure is only logged.
            {
                let teardown = teardown.clone();
                let client = Arc::clone(&client);
                let state = Arc::clone(&state);
                let name = name.clone();
                tasks.spawn(async move {
                    teardown.cancelled().await;
                    if *state.lock() != ObserverState::Stopped {
                        *state.lock() = ObserverState::Stopping;
                    }
                    info!("Signalling observer pod {name:?} to terminate...");
                    if let Err(err) = client.delete_pod(&namespace, &name).await {
                        if !err.is_not_found() {
                            warn!(error = %err, "failed to trigger observer to stop");
                        }
                    }
                });
            }

            // Waiter: follows the pod to completion or teardown. The wait
            // runs under the caller's cancellation scope, not the teardown
            // token: teardown stops an observer by deleting its pod, and
            // the interruptible wait then ends cleanly. The outcome is
            // reported only when the run was not ended by the teardown
            // itself.
            {
                let teardown = teardown.clone();
                let outer = cancel.clone();
                let records = Arc::clone(&records);
                let test_name = test_name.to_string();
                tasks.spawn(async move {
                    *state.lock() = ObserverState::Running;
                    let result = wait_and_record(
                        step_client,
                        records,
                        test_name,
                        pod,
                        WaitOptions {
                            interruptible: true,
                            timeout: None,
                        },
                        outer,
                    )
                    .await;
                    match result {
                        Err(err) if teardown.is_cancelled() || err.is_cancelled() => {
                            debug!("ignoring observer error after cancellation: {err}");
                        }
                        Err(err) => warn!(error = %err, "observer failed"),
                        Ok(()) => {}
                    }
                    *state.lock() = ObserverState::Stopped;
                });
            }
        }

        ObserverCoordinator {
            teardown,
            handles,
            tasks,
        }
    }

    /// Signal every observer to stop. Idempotent.
    pub fn begin_teardown(&self) {
        self.teardown.cancel();
    }

    /// Wait for every observer task to finish. Completion implies every
    /// observer's state machine reached `Stopped`.
    pub async fn wait(mut self) {
        while self.tasks.join_next().await.is_some() {}
        for handle in &self.handles {
            let state = *handle.state.lock();
            if state != ObserverState::Stopped {
                warn!(observer = %handle.name, ?state, "observer finished in unexpected state");
            }
        }
    }

    /// Current states, for diagnostics and tests.
    pub fn states(&self) -> Vec<(String, ObserverState)> {
        self.handles
            .iter()
            .map(|h| (h.name.clone(), *h.state.lock()))
            .collect()
    }
}
