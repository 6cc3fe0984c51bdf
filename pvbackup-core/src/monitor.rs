//! Pod monitor: dual concurrent log/event streamers for a single pod (§4.2).

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::{AsyncBufReadExt as _, TryStreamExt};
use k8s_openapi::api::core::v1::{Event as CoreEvent, Pod};
use kube::api::{Api, ListParams, LogParams, WatchEvent};
use kube::ResourceExt;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// How many distinct event UIDs are remembered per pod before the oldest is evicted
const EVENT_UID_CACHE_SIZE: usize = 200;
/// Poll interval while waiting for the pod to reach a terminal phase
const PHASE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Server-side watch timeout requested for the event stream; a natural reconnect point
const EVENT_WATCH_TIMEOUT_SECS: u32 = 60;

/// The terminal phase a monitored pod settled into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalPhase {
    /// Pod phase `Succeeded`
    Succeeded,
    /// Pod phase `Failed`
    Failed,
}

/// Watches a single pod's logs and events until it reaches a terminal phase
pub struct PodMonitor {
    pods: Api<Pod>,
    events: Api<CoreEvent>,
    pod_name: String,
}

impl PodMonitor {
    /// Build a monitor for `pod_name`
    #[must_use]
    pub fn new(pods: Api<Pod>, events: Api<CoreEvent>, pod_name: impl Into<String>) -> Self {
        Self {
            pods,
            events,
            pod_name: pod_name.into(),
        }
    }

    /// Block until the pod reaches `Succeeded`/`Failed`, or return early once
    /// `cancelled` resolves. The log and event streams run for the duration
    /// as best-effort background work; their own errors are logged, not
    /// propagated, so a flaky watch never blocks terminal-phase detection.
    pub async fn watch_until_terminal(
        &self,
        cancelled: impl std::future::Future<Output = ()>,
    ) -> Result<TerminalPhase> {
        let log_handle = tokio::spawn(run_log_stream(self.pods.clone(), self.pod_name.clone()));
        let event_handle = tokio::spawn(run_event_stream(
            self.events.clone(),
            self.pod_name.clone(),
        ));

        tokio::pin!(cancelled);
        let phase = tokio::select! {
            phase = self.poll_terminal_phase() => phase,
            () = &mut cancelled => Err(Error::Timeout(format!(
                "cancelled while waiting for pod {} to reach a terminal phase",
                self.pod_name
            ))),
        };

        log_handle.abort();
        event_handle.abort();
        phase
    }

    async fn poll_terminal_phase(&self) -> Result<TerminalPhase> {
        loop {
            let pod = self.pods.get(&self.pod_name).await?;
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Succeeded") => return Ok(TerminalPhase::Succeeded),
                Some("Failed") => return Ok(TerminalPhase::Failed),
                _ => sleep(PHASE_POLL_INTERVAL).await,
            }
        }
    }
}

/// Wait for the pod's first container to report a started-at timestamp, then
/// follow its logs for the lifetime of the pod, prefixing every line.
///
/// Following logs before the container starts returns a 400; that error is
/// swallowed while waiting, since the monitor retries. After the container
/// has started, any error other than the stream closing naturally is logged
/// (this task's errors are not propagated to the caller, see
/// `watch_until_terminal`).
async fn run_log_stream(pods: Api<Pod>, pod_name: String) {
    loop {
        match pods.get(&pod_name).await {
            Ok(pod) => {
                let started = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref())
                    .and_then(|statuses| statuses.first())
                    .and_then(|status| status.state.as_ref())
                    .and_then(|state| state.running.as_ref())
                    .and_then(|running| running.started_at.as_ref())
                    .is_some();
                if started {
                    break;
                }
            }
            Err(err) => {
                warn!(pod = %pod_name, "log stream: failed to read pod while waiting for start: {err}");
            }
        }
        sleep(Duration::from_secs(1)).await;
    }

    let params = LogParams {
        follow: true,
        ..LogParams::default()
    };
    let stream = match pods.log_stream(&pod_name, &params).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(pod = %pod_name, "log stream: failed to open: {err}");
            return;
        }
    };

    let mut lines = stream.lines();
    loop {
        match lines.try_next().await {
            Ok(Some(line)) => info!("[{pod_name}] {line}"),
            Ok(None) => break,
            Err(err) => {
                warn!(pod = %pod_name, "log stream: read error: {err}");
                break;
            }
        }
    }
}

/// Field-selected watch on events for `pod_name`, reconnected on the
/// watch's natural timeout and on 410 Gone.
///
/// Per §9 "resume by the list envelope's `resourceVersion` (not an
/// individual event's)": every reconnect re-lists to obtain a fresh
/// starting point rather than trusting a `resourceVersion` carried forward
/// from a prior watch event, since a Bookmark is not guaranteed to arrive
/// before the connection drops. Deduplicates by event UID against a capped
/// in-memory set so reconnection never re-emits an already-seen event.
async fn run_event_stream(events: Api<CoreEvent>, pod_name: String) {
    let mut seen_order: VecDeque<String> = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();
    let field_selector = format!("involvedObject.name={pod_name}");

    loop {
        let resource_version = match events
            .list(&ListParams::default().fields(&field_selector))
            .await
        {
            Ok(list) => list.metadata.resource_version.unwrap_or_default(),
            Err(err) => {
                warn!(pod = %pod_name, "event stream: list failed, retrying: {err}");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let params = ListParams::default()
            .fields(&field_selector)
            .timeout(EVENT_WATCH_TIMEOUT_SECS);
        let stream = match events.watch(&params, &resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(pod = %pod_name, "event stream: watch failed, retrying: {err}");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        tokio::pin!(stream);

        'watch: loop {
            match stream.try_next().await {
                Ok(Some(WatchEvent::Added(event) | WatchEvent::Modified(event))) => {
                    let uid = event.metadata.uid.clone().unwrap_or_default();
                    if uid.is_empty() || !seen.insert(uid.clone()) {
                        continue;
                    }
                    seen_order.push_back(uid);
                    if seen_order.len() > EVENT_UID_CACHE_SIZE {
                        if let Some(oldest) = seen_order.pop_front() {
                            seen.remove(&oldest);
                        }
                    }
                    let kind = event.type_.clone().unwrap_or_default();
                    let reason = event.reason.clone().unwrap_or_default();
                    let message = event.message.clone().unwrap_or_default();
                    info!("[EVENT] {kind} {reason}: {message}");
                }
                Ok(Some(WatchEvent::Bookmark(_) | WatchEvent::Deleted(_))) => {}
                Ok(Some(WatchEvent::Error(err))) => {
                    warn!(pod = %pod_name, "event stream: server error, reconnecting: {err:?}");
                    break 'watch;
                }
                Ok(None) => break 'watch,
                Err(err) => {
                    warn!(pod = %pod_name, "event stream: reconnecting after: {err}");
                    break 'watch;
                }
            }
        }
    }
}
