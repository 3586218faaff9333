//! Resource reconciliation: idempotent application of infra stacks, chart
//! releases, ingress, issuer, and pod restarts. Each action is re-runnable;
//! an already-satisfied desired state is a no-op.

#![forbid(unsafe_code)]

pub mod aws;
pub mod helm;
pub mod infra;
pub mod ingress;
pub mod issuer;

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams},
    Api, Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use comply_core::{IacEngine, InputProvider, ProgressSample, ReconcileAction, ReconcileResult};

/// Field manager for all server-side applies.
pub const FIELD_MANAGER: &str = "complyctl";

/// Everything a reconcile step may need, threaded as an immutable snapshot.
pub struct ReconcileCtx<'a> {
    pub client: &'a Client,
    pub input: &'a dyn InputProvider,
    pub engine: IacEngine,
    /// Apply even when the live object already matches.
    pub always_apply: bool,
    pub cancel: &'a CancellationToken,
    /// Receiver for background-apply progress, when the caller wants it.
    pub progress: Option<mpsc::Sender<ProgressSample>>,
}

pub async fn reconcile(ctx: &ReconcileCtx<'_>, action: &ReconcileAction) -> Result<ReconcileResult> {
    let t0 = std::time::Instant::now();
    counter!("reconcile_attempts", 1u64);
    info!(kind = action.kind_str(), key = %action.idempotency_key(), "reconciling");

    let res = match action {
        ReconcileAction::CreateInfra { region, .. } => infra::create(ctx, region.as_deref()).await,
        ReconcileAction::DestroyInfra { .. } => infra::destroy(ctx).await,
        ReconcileAction::InstallChart { release, namespace, chart, values } => {
            helm::reconcile_install(ctx, release, namespace, chart, values).await
        }
        ReconcileAction::UpgradeChart { release, namespace, chart, values } => {
            helm::reconcile_upgrade(release, namespace, chart, values).await
        }
        ReconcileAction::ApplyIngress { namespace, shape } => {
            ingress::apply(ctx, namespace, shape).await
        }
        ReconcileAction::ApplyIssuer { name, email, ingress_class } => {
            issuer::apply(ctx, name, email, ingress_class).await
        }
        ReconcileAction::RestartPods { namespace, selector } => {
            restart_pods(ctx.client, namespace, selector).await
        }
    };

    match &res {
        Ok(r) => {
            histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("reconcile_ok", 1u64);
            info!(
                kind = action.kind_str(),
                applied = r.applied,
                detail = %r.detail,
                "reconcile complete"
            );
        }
        Err(_) => {
            counter!("reconcile_err", 1u64);
        }
    }
    res
}

/// Delete pods matching the selector to force a config re-read. Always
/// restarts; safe to repeat.
async fn restart_pods(client: &Client, namespace: &str, selector: &str) -> Result<ReconcileResult> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(selector);
    api.delete_collection(&DeleteParams::default(), &lp).await?;
    Ok(ReconcileResult::changed(format!(
        "restarted pods matching {selector} in {namespace}"
    )))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    /// The desired state is fully present in the live object. Extra live
    /// fields (server defaults, controller annotations) do not count.
    pub fn satisfied(&self) -> bool {
        self.adds == 0 && self.updates == 0
    }
}

/// Drop server-populated noise before diffing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv {
                            continue;
                        }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) {
                        *rems += 1;
                    }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        *ups += 1;
                    }
                }
                if aa.len() > bb.len() {
                    *adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    *rems += bb.len() - aa.len();
                }
            }
            (av, bv) => {
                if av != bv {
                    *ups += 1;
                }
            }
        }
    }
    let mut adds = 0usize;
    let mut ups = 0usize;
    let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Does the live object (if any) already satisfy the desired spec?
pub fn needs_apply(desired: &Json, live: Option<&Json>) -> bool {
    match live {
        None => true,
        Some(live) => !diff_summary(desired, live).satisfied(),
    }
}
