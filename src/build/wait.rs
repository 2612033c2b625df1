//! Lifecycle waits over the pod observation cache.
//!
//! Conditions are pure functions from pod state to one of three
//! outcomes; the poll turns them into bounded synchronous waits with
//! exactly three results: satisfied, failed, or timed out.

use crate::cluster::{Pod, PodPhase, PodWatcher};
use crate::errors::BuildError;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Result of evaluating a condition against one pod observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    NotYet,
    Satisfied,
    Failed { reason: String, message: String },
}

/// Start condition: the pod has reached Running, Succeeded, or Failed.
/// A Failed phase here is terminal and carries the pod's own reason.
pub fn start_condition(pod: &Pod) -> ConditionOutcome {
    match pod.status.phase {
        PodPhase::Running | PodPhase::Succeeded => ConditionOutcome::Satisfied,
        PodPhase::Failed => ConditionOutcome::Failed {
            reason: pod.status.reason.clone(),
            message: pod.status.message.clone(),
        },
        PodPhase::Pending | PodPhase::Unknown => ConditionOutcome::NotYet,
    }
}

/// End condition: the pod has reached Succeeded or Failed. Failure is a
/// normal finished state; exit codes are inspected afterwards.
pub fn end_condition(pod: &Pod) -> ConditionOutcome {
    match pod.status.phase {
        PodPhase::Succeeded | PodPhase::Failed => ConditionOutcome::Satisfied,
        _ => ConditionOutcome::NotYet,
    }
}

/// Poll `fetch` against `condition` every `interval` until the condition
/// resolves or `timeout` elapses. The first check happens immediately.
pub async fn wait_for_condition<F>(
    fetch: F,
    condition: fn(&Pod) -> ConditionOutcome,
    interval: Duration,
    timeout: Duration,
) -> Result<(), BuildError>
where
    F: Fn() -> Vec<Pod>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pod) = fetch().first() {
            match condition(pod) {
                ConditionOutcome::Satisfied => return Ok(()),
                ConditionOutcome::Failed { reason, message } => {
                    return Err(BuildError::StartupFailed { reason, message });
                }
                ConditionOutcome::NotYet => {}
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(BuildError::Timeout { waited: timeout });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Wait for the build pod to start, emitting a progress indicator at
/// `ticker_interval` while the poll runs.
pub async fn wait_for_pod_start(
    watcher: &PodWatcher,
    ticker_interval: Duration,
    interval: Duration,
    timeout: Duration,
) -> Result<(), BuildError> {
    let ticker = progress("...", ticker_interval);
    let res = wait_for_condition(|| watcher.pods(), start_condition, interval, timeout).await;
    ticker.stop().await;
    res
}

/// Wait for the build pod to finish, in either terminal phase.
pub async fn wait_for_pod_end(
    watcher: &PodWatcher,
    interval: Duration,
    timeout: Duration,
) -> Result<(), BuildError> {
    wait_for_condition(|| watcher.pods(), end_condition, interval, timeout).await
}

/// Background ticker printing `msg` to the pusher at a fixed interval.
/// Carries no semantic weight; purely feedback while a wait runs.
pub struct ProgressTicker {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Start the ticker. [`ProgressTicker::stop`] performs a synchronous
/// stop handshake: after it returns, no further message is printed.
pub fn progress(msg: &str, interval: Duration) -> ProgressTicker {
    let msg = msg.to_string();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The first interval tick fires immediately; swallow it so the
        // first message appears one full interval in.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tick.tick() => println!("{msg}"),
            }
        }
    });
    ProgressTicker { stop_tx, task }
}

impl ProgressTicker {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Pod;
    use std::sync::{Arc, Mutex};

    const TICK: Duration = Duration::from_millis(5);
    const PATIENCE: Duration = Duration::from_millis(500);

    fn pod(phase: PodPhase) -> Pod {
        Pod::stub("builder-1", "job-1", phase)
    }

    #[test]
    fn start_condition_covers_all_phases() {
        assert_eq!(start_condition(&pod(PodPhase::Pending)), ConditionOutcome::NotYet);
        assert_eq!(
            start_condition(&pod(PodPhase::Running)),
            ConditionOutcome::Satisfied
        );
        assert_eq!(
            start_condition(&pod(PodPhase::Succeeded)),
            ConditionOutcome::Satisfied
        );

        let mut failed = pod(PodPhase::Failed);
        failed.status.reason = "Evicted".to_string();
        failed.status.message = "node pressure".to_string();
        assert_eq!(
            start_condition(&failed),
            ConditionOutcome::Failed {
                reason: "Evicted".to_string(),
                message: "node pressure".to_string(),
            }
        );
    }

    #[test]
    fn end_condition_accepts_both_terminal_phases() {
        assert_eq!(end_condition(&pod(PodPhase::Running)), ConditionOutcome::NotYet);
        assert_eq!(
            end_condition(&pod(PodPhase::Succeeded)),
            ConditionOutcome::Satisfied
        );
        // A failed pod finishes the wait without being an error here;
        // the caller inspects exit codes separately.
        assert_eq!(
            end_condition(&pod(PodPhase::Failed)),
            ConditionOutcome::Satisfied
        );
    }

    #[tokio::test]
    async fn wait_resolves_once_the_pod_transitions() {
        let observed = Arc::new(Mutex::new(vec![pod(PodPhase::Pending)]));
        let flip = observed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            *flip.lock().unwrap() = vec![pod(PodPhase::Running)];
        });

        let fetch = move || observed.lock().unwrap().clone();
        wait_for_condition(fetch, start_condition, TICK, PATIENCE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pod_failing_before_running_fails_the_start_wait() {
        let mut failed = pod(PodPhase::Failed);
        failed.status.reason = "ImagePullBackOff".to_string();
        let fetch = move || vec![failed.clone()];
        let err = wait_for_condition(fetch, start_condition, TICK, PATIENCE)
            .await
            .unwrap_err();
        match err {
            BuildError::StartupFailed { reason, .. } => assert_eq!(reason, "ImagePullBackOff"),
            other => panic!("expected StartupFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expiry_yields_timeout_not_failure() {
        let fetch = || vec![pod(PodPhase::Pending)];
        let err = wait_for_condition(fetch, start_condition, TICK, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_cache_waits_rather_than_failing() {
        let err = wait_for_condition(Vec::new, end_condition, TICK, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
    }

    #[tokio::test]
    async fn ticker_stop_handshake_completes() {
        let ticker = progress("...", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(25)).await;
        ticker.stop().await;
    }
}
