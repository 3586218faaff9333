//! Cluster issuer: ACME configuration bound to the operator's email with an
//! HTTP-01 solver scoped to the ingress class. Idempotent by name.

use anyhow::{anyhow, Result};
use kube::{
    api::{Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api,
};
use serde_json::Value as Json;
use tracing::debug;

use comply_core::ReconcileResult;

use crate::{ReconcileCtx, FIELD_MANAGER};

pub const ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

pub fn desired(name: &str, email: &str, ingress_class: &str) -> Json {
    serde_json::json!({
        "apiVersion": "cert-manager.io/v1",
        "kind": "ClusterIssuer",
        "metadata": { "name": name },
        "spec": {
            "acme": {
                "email": email,
                "server": ACME_DIRECTORY,
                "privateKeySecretRef": { "name": format!("{name}-account-key") },
                "solvers": [
                    { "http01": { "ingress": { "class": ingress_class } } }
                ]
            }
        }
    })
}

pub async fn apply(
    ctx: &ReconcileCtx<'_>,
    name: &str,
    email: &str,
    ingress_class: &str,
) -> Result<ReconcileResult> {
    let gvk = GroupVersionKind::gvk("cert-manager.io", "v1", "ClusterIssuer");
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ar);
    if !ctx.always_apply && api.get_opt(name).await?.is_some() {
        debug!(issuer = name, "issuer already present");
        return Ok(ReconcileResult::no_op(format!("issuer {name} exists")));
    }
    let pp = PatchParams::apply(FIELD_MANAGER);
    api.patch(name, &pp, &Patch::Apply(&desired(name, email, ingress_class)))
        .await
        .map_err(|e| anyhow!("server-side apply of issuer failed: {e}"))?;
    Ok(ReconcileResult::changed(format!("issuer {name} applied for {email}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_shape_matches_acme_contract() {
        let v = desired("letsencrypt", "ops@example.com", "nginx");
        assert_eq!(v["kind"], "ClusterIssuer");
        let acme = &v["spec"]["acme"];
        assert_eq!(acme["email"], "ops@example.com");
        assert_eq!(acme["server"], ACME_DIRECTORY);
        assert_eq!(acme["privateKeySecretRef"]["name"], "letsencrypt-account-key");
        assert_eq!(acme["solvers"][0]["http01"]["ingress"]["class"], "nginx");
    }
}
