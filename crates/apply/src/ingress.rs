//! Desired ingress construction (three shapes) and idempotent server-side
//! apply against the live object.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Patch, PatchParams},
    Api,
};
use tracing::debug;

use comply_core::{config, IngressShape, ReconcileResult, TlsSource};

use crate::{needs_apply, strip_noisy, ReconcileCtx, FIELD_MANAGER};

pub const INGRESS_NAME: &str = "opencomply";
pub const TLS_SECRET: &str = "opencomply-tls";

fn backend() -> IngressBackend {
    IngressBackend {
        service: Some(IngressServiceBackend {
            name: config::APP_SERVICE.to_string(),
            port: Some(ServiceBackendPort {
                number: Some(i32::from(config::APP_SERVICE_PORT)),
                name: None,
            }),
        }),
        resource: None,
    }
}

fn rule(host: Option<&str>) -> IngressRule {
    IngressRule {
        host: host.map(str::to_string),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: backend(),
            }],
        }),
    }
}

/// Build the typed ingress for one of the three shapes.
pub fn desired(namespace: &str, shape: &IngressShape) -> Ingress {
    let mut annotations = BTreeMap::new();
    let mut class = "nginx".to_string();
    let mut tls = None;

    match shape {
        IngressShape::Hostless | IngressShape::Host { .. } => {}
        IngressShape::HostTls { host, tls: source } => match source {
            TlsSource::AcmeIssuer { issuer } => {
                annotations.insert("cert-manager.io/cluster-issuer".to_string(), issuer.clone());
                tls = Some(vec![IngressTLS {
                    hosts: Some(vec![host.clone()]),
                    secret_name: Some(TLS_SECRET.to_string()),
                }]);
            }
            TlsSource::AcmCertificate { arn } => {
                // Provider-issued cert: TLS terminates at the ALB.
                class = "alb".to_string();
                annotations.insert(
                    "alb.ingress.kubernetes.io/certificate-arn".to_string(),
                    arn.clone(),
                );
                annotations.insert(
                    "alb.ingress.kubernetes.io/scheme".to_string(),
                    "internet-facing".to_string(),
                );
                annotations.insert(
                    "alb.ingress.kubernetes.io/target-type".to_string(),
                    "ip".to_string(),
                );
                annotations.insert(
                    "alb.ingress.kubernetes.io/listen-ports".to_string(),
                    r#"[{"HTTPS":443}]"#.to_string(),
                );
            }
        },
    }

    Ingress {
        metadata: ObjectMeta {
            name: Some(INGRESS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: if annotations.is_empty() { None } else { Some(annotations) },
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(class),
            rules: Some(vec![rule(shape.host())]),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}

/// Diff against the live object and server-side apply only when different
/// (or when unconditional mode was requested).
pub async fn apply(
    ctx: &ReconcileCtx<'_>,
    namespace: &str,
    shape: &IngressShape,
) -> Result<ReconcileResult> {
    let desired = desired(namespace, shape);
    let api: Api<Ingress> = Api::namespaced(ctx.client.clone(), namespace);
    let desired_json = strip_noisy(serde_json::to_value(&desired)?);
    let live_json = match api.get_opt(INGRESS_NAME).await? {
        Some(live) => Some(strip_noisy(serde_json::to_value(&live)?)),
        None => None,
    };
    if !ctx.always_apply && !needs_apply(&desired_json, live_json.as_ref()) {
        debug!(namespace, "ingress already matches desired spec");
        return Ok(ReconcileResult::no_op("ingress up to date"));
    }
    let pp = PatchParams::apply(FIELD_MANAGER);
    api.patch(INGRESS_NAME, &pp, &Patch::Apply(&desired))
        .await
        .map_err(|e| anyhow!("server-side apply of ingress failed: {e}"))?;
    Ok(ReconcileResult::changed(format!(
        "ingress applied ({})",
        match shape {
            IngressShape::Hostless => "hostless".to_string(),
            IngressShape::Host { host } => format!("host {host}"),
            IngressShape::HostTls { host, .. } => format!("host {host} + TLS"),
        }
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::IngressShape;

    #[test]
    fn hostless_shape_has_no_host_or_tls() {
        let ing = desired("opencomply", &IngressShape::Hostless);
        let spec = ing.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        assert!(spec.tls.is_none());
        assert!(spec.rules.as_ref().unwrap()[0].host.is_none());
        assert!(ing.metadata.annotations.is_none());
    }

    #[test]
    fn host_only_shape_sets_host() {
        let ing = desired(
            "opencomply",
            &IngressShape::Host { host: "app.example.com".into() },
        );
        let spec = ing.spec.unwrap();
        assert_eq!(
            spec.rules.as_ref().unwrap()[0].host.as_deref(),
            Some("app.example.com")
        );
        assert!(spec.tls.is_none());
    }

    #[test]
    fn acme_shape_binds_issuer_and_secret() {
        let ing = desired(
            "opencomply",
            &IngressShape::HostTls {
                host: "app.example.com".into(),
                tls: TlsSource::AcmeIssuer { issuer: "letsencrypt".into() },
            },
        );
        let ann = ing.metadata.annotations.unwrap();
        assert_eq!(ann.get("cert-manager.io/cluster-issuer").unwrap(), "letsencrypt");
        let tls = ing.spec.unwrap().tls.unwrap();
        assert_eq!(tls[0].secret_name.as_deref(), Some(TLS_SECRET));
        assert_eq!(tls[0].hosts.as_ref().unwrap()[0], "app.example.com");
    }

    #[test]
    fn acm_shape_uses_alb_class_and_cert_arn() {
        let arn = "arn:aws:acm:us-east-1:111122223333:certificate/abc";
        let ing = desired(
            "opencomply",
            &IngressShape::HostTls {
                host: "app.example.com".into(),
                tls: TlsSource::AcmCertificate { arn: arn.into() },
            },
        );
        assert_eq!(ing.spec.as_ref().unwrap().ingress_class_name.as_deref(), Some("alb"));
        let ann = ing.metadata.annotations.unwrap();
        assert_eq!(ann.get("alb.ingress.kubernetes.io/certificate-arn").unwrap(), arn);
        // ALB terminates TLS; no secret-backed tls block.
        assert!(ing.spec.unwrap().tls.is_none());
    }

    #[test]
    fn second_apply_with_unchanged_spec_is_a_no_op() {
        // Simulate the post-apply live object: same spec plus server noise.
        let desired_obj = desired("opencomply", &IngressShape::Hostless);
        let desired_json = crate::strip_noisy(serde_json::to_value(&desired_obj).unwrap());
        let mut live = serde_json::to_value(&desired_obj).unwrap();
        live["metadata"]["uid"] = serde_json::json!("123e4567");
        live["metadata"]["resourceVersion"] = serde_json::json!("42");
        live["status"] = serde_json::json!({ "loadBalancer": {} });
        let live = crate::strip_noisy(live);
        assert!(!crate::needs_apply(&desired_json, Some(&live)));
    }
}
