//! Readiness polling. One cancellable poll-until-condition utility drives
//! all four waits: namespace pods, the migration job, the external address,
//! and the certificate issuer.

#![forbid(unsafe_code)]

use std::future::Future;

use tokio::time::Instant;

use anyhow::Result;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::ListParams,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api, Client,
};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use comply_core::{config, InstallError, PollPolicy};

/// One observation from a probe.
pub enum Probe<T> {
    Ready(T),
    Pending(String),
}

/// Terminal outcome of a wait. `TimedOut` carries the last observation so
/// the caller can decide whether the timeout is fatal and what to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut { last: String },
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Poll `probe` at `policy.interval` until it reports ready, the timeout
/// elapses, or the token is cancelled (which aborts with `Aborted`).
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<WaitOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    // Deadline and sleeps must share tokio's clock, or paused-time tests
    // (and any clock skew) would race the two apart.
    let started = Instant::now();
    let deadline = started + policy.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(InstallError::Aborted.into());
        }
        let last = match probe().await? {
            Probe::Ready(v) => {
                histogram!("wait_ready_seconds", started.elapsed().as_secs_f64());
                info!(what, elapsed_s = started.elapsed().as_secs(), "ready");
                return Ok(WaitOutcome::Ready(v));
            }
            Probe::Pending(obs) => {
                debug!(what, observed = %obs, "waiting");
                obs
            }
        };
        let now = Instant::now();
        if now >= deadline {
            counter!("wait_timeouts", 1u64);
            return Ok(WaitOutcome::TimedOut { last });
        }
        let step = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(InstallError::Aborted.into()),
            _ = tokio::time::sleep(step) => {}
        }
    }
}

const BAD_WAIT_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

/// Pods outside a terminal healthy state. A pod counts as offending when its
/// phase is not Running/Succeeded, or a container sits in a crash/error
/// waiting state. Returns one table row per offender.
pub fn offending_pods(pods: &[Pod]) -> Vec<String> {
    let mut rows = Vec::new();
    for pod in pods {
        let name = pod.metadata.name.as_deref().unwrap_or("(unnamed)");
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        let waiting_reason = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| {
                cs.iter().find_map(|c| {
                    c.state
                        .as_ref()
                        .and_then(|st| st.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref())
                        .filter(|r| BAD_WAIT_REASONS.contains(r))
                })
            });
        let healthy_phase = matches!(phase, "Running" | "Succeeded");
        if !healthy_phase || waiting_reason.is_some() {
            rows.push(format!("{name}\t{phase}\t{}", waiting_reason.unwrap_or("-")));
        }
    }
    rows
}

/// Wait until every pod in the namespace is in a terminal healthy state.
pub async fn pods_healthy(
    client: &Client,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<()>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    poll_until("pods healthy", config::pod_ready(), cancel, move || {
        let api = api.clone();
        async move {
            let pods = api.list(&ListParams::default()).await?;
            let bad = offending_pods(&pods.items);
            if bad.is_empty() {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Pending(format!(
                    "{} pod(s) not ready:\n{}",
                    bad.len(),
                    bad.join("\n")
                )))
            }
        }
    })
    .await
}

pub async fn job_exists(client: &Client, namespace: &str, name: &str) -> Result<bool> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?.is_some())
}

/// Wait for a one-shot migration job to reach a completed state.
pub async fn job_complete(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<()>> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let name = name.to_string();
    poll_until("migration job", config::migration_job(), cancel, move || {
        let api = api.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await? {
                None => Ok(Probe::Pending(format!("job {name} not found"))),
                Some(job) => {
                    let status = job.status.unwrap_or_default();
                    if status.succeeded.unwrap_or(0) > 0 {
                        Ok(Probe::Ready(()))
                    } else {
                        Ok(Probe::Pending(format!(
                            "job {name}: active={} failed={}",
                            status.active.unwrap_or(0),
                            status.failed.unwrap_or(0)
                        )))
                    }
                }
            }
        }
    })
    .await
}

/// Wait for a LoadBalancer service to acquire an externally routable address.
pub async fn service_address(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<String>> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = name.to_string();
    poll_until("service external address", config::external_address(), cancel, move || {
        let api = api.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await? {
                None => Ok(Probe::Pending(format!("service {name} not found"))),
                Some(svc) => {
                    let addr = svc
                        .status
                        .as_ref()
                        .and_then(|s| s.load_balancer.as_ref())
                        .and_then(|lb| lb.ingress.as_ref())
                        .and_then(|ing| ing.first())
                        .and_then(|i| i.hostname.clone().or_else(|| i.ip.clone()));
                    match addr {
                        Some(a) => Ok(Probe::Ready(a)),
                        None => Ok(Probe::Pending("no load balancer address yet".to_string())),
                    }
                }
            }
        }
    })
    .await
}

/// Wait for an Ingress object to be assigned an external address (the ALB
/// path surfaces the address on the ingress, not on a service).
pub async fn ingress_address(
    client: &Client,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<String>> {
    let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let name = name.to_string();
    poll_until("ingress external address", config::external_address(), cancel, move || {
        let api = api.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await? {
                None => Ok(Probe::Pending(format!("ingress {name} not found"))),
                Some(ing) => {
                    let addr = ing
                        .status
                        .as_ref()
                        .and_then(|s| s.load_balancer.as_ref())
                        .and_then(|lb| lb.ingress.as_ref())
                        .and_then(|items| items.first())
                        .and_then(|i| i.hostname.clone().or_else(|| i.ip.clone()));
                    match addr {
                        Some(a) => Ok(Probe::Ready(a)),
                        None => Ok(Probe::Pending("no address on ingress yet".to_string())),
                    }
                }
            }
        }
    })
    .await
}

/// Wait for the cluster issuer to report `Ready=True`.
pub async fn issuer_ready(
    client: &Client,
    name: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome<()>> {
    let gvk = GroupVersionKind::gvk("cert-manager.io", "v1", "ClusterIssuer");
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    let name = name.to_string();
    poll_until("issuer ready", config::issuer_ready(), cancel, move || {
        let api = api.clone();
        let name = name.clone();
        async move {
            match api.get_opt(&name).await? {
                None => Ok(Probe::Pending(format!("issuer {name} not found"))),
                Some(obj) => {
                    if issuer_condition_ready(&obj.data) {
                        Ok(Probe::Ready(()))
                    } else {
                        Ok(Probe::Pending(format!("issuer {name} not ready")))
                    }
                }
            }
        }
    })
    .await
}

pub fn issuer_condition_ready(data: &serde_json::Value) -> bool {
    data.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(timeout_s: u64, interval_s: u64) -> PollPolicy {
        PollPolicy {
            timeout: Duration::from_secs(timeout_s),
            interval: Duration::from_secs(interval_s),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_polls() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let out = poll_until("t", policy(60, 5), &cancel, move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) >= 2 {
                    Ok(Probe::Ready(42u32))
                } else {
                    Ok(Probe::Pending("not yet".into()))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, WaitOutcome::Ready(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_last_observation() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let out: WaitOutcome<()> = poll_until("t", policy(30, 10), &cancel, || async {
            Ok(Probe::Pending("1 pod(s) not ready".into()))
        })
        .await
        .unwrap();
        assert_eq!(out, WaitOutcome::TimedOut { last: "1 pod(s) not ready".into() });
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_latest_observation() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let out: WaitOutcome<()> = poll_until("t", policy(30, 10), &cancel, move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Probe::Pending(format!("attempt {n}")))
            }
        })
        .await
        .unwrap();
        // Probes at t=0/10/20/30; the deadline check sees the fourth.
        assert_eq!(out, WaitOutcome::TimedOut { last: "attempt 4".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll_until::<(), _, _>("t", policy(30, 10), &cancel, || async {
            Ok(Probe::Pending("x".into()))
        })
        .await
        .unwrap_err();
        let ie = err.downcast_ref::<InstallError>().unwrap();
        assert_eq!(ie.category(), "aborted");
    }

    fn pod(name: &str, phase: &str, waiting_reason: Option<&str>) -> Pod {
        let statuses = match waiting_reason {
            Some(r) => serde_json::json!([
                { "name": "c", "ready": false, "restartCount": 3, "image": "i", "imageID": "",
                  "state": { "waiting": { "reason": r } } }
            ]),
            None => serde_json::json!([]),
        };
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name },
            "status": { "phase": phase, "containerStatuses": statuses }
        }))
        .unwrap()
    }

    #[test]
    fn offending_pod_classification() {
        let pods = vec![
            pod("ok", "Running", None),
            pod("done", "Succeeded", None),
            pod("crash", "Running", Some("CrashLoopBackOff")),
            pod("stuck", "Pending", None),
        ];
        let bad = offending_pods(&pods);
        assert_eq!(bad.len(), 2);
        assert!(bad[0].starts_with("crash\tRunning\tCrashLoopBackOff"));
        assert!(bad[1].starts_with("stuck\tPending"));
    }

    #[test]
    fn no_pods_means_no_offenders() {
        assert!(offending_pods(&[]).is_empty());
    }

    #[test]
    fn issuer_condition_parsing() {
        let ready = serde_json::json!({
            "status": { "conditions": [ { "type": "Ready", "status": "True" } ] }
        });
        assert!(issuer_condition_ready(&ready));
        let not_ready = serde_json::json!({
            "status": { "conditions": [ { "type": "Ready", "status": "False" } ] }
        });
        assert!(!issuer_condition_ready(&not_ready));
        assert!(!issuer_condition_ready(&serde_json::json!({})));
    }
}
