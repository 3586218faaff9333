//! End-to-end planning scenarios: each maps a target + cluster snapshot to
//! the exact ordered action list the reconciler will walk.

use comply_core::{
    CertificateRef, ClusterContext, ClusterProvider, DeploymentTarget, IngressShape, Platform,
    ReconcileAction, TlsSource,
};
use comply_plan::{plan, InstallType, PlanInput, PlanOptions, ISSUER_NAME};

fn target(platform: Platform, domain: Option<&str>, email: Option<&str>) -> DeploymentTarget {
    DeploymentTarget {
        platform,
        domain: domain.map(str::to_string),
        email: email.map(str::to_string),
        use_https: domain.is_some() && email.is_some(),
        region: None,
    }
}

fn cluster() -> ClusterContext {
    ClusterContext {
        provider: ClusterProvider::Other,
        ready_nodes: 3,
        releases: vec![],
    }
}

fn opts(install_type: InstallType) -> PlanOptions {
    PlanOptions {
        install_type,
        use_existing_infra: false,
        upgrade: false,
        debug: false,
    }
}

#[test]
fn no_domain_no_email_installs_hostless_ingress() {
    let target = target(Platform::Generic, None, None);
    let cluster = cluster();
    let opts = opts(InstallType::Ingress);
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });

    assert_eq!(actions.len(), 3);
    match &actions[0] {
        ReconcileAction::InstallChart { release, values, .. } => {
            assert_eq!(release, "opencomply");
            // no domain -> no TLS, no dex issuer override
            assert!(values.get("dex").is_none());
        }
        other => panic!("expected app chart first, got {other:?}"),
    }
    match &actions[1] {
        ReconcileAction::InstallChart { release, .. } => assert_eq!(release, "ingress-nginx"),
        other => panic!("expected ingress controller, got {other:?}"),
    }
    assert!(matches!(
        &actions[2],
        ReconcileAction::ApplyIngress { shape: IngressShape::Hostless, .. }
    ));
}

#[test]
fn basic_install_type_emits_no_ingress_actions() {
    let target = target(Platform::Generic, None, None);
    let cluster = cluster();
    let opts = opts(InstallType::PortForward);
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], ReconcileAction::InstallChart { .. }));
}

#[test]
fn domain_and_email_without_cert_goes_through_acme() {
    let target = target(Platform::Generic, Some("app.example.com"), Some("ops@example.com"));
    let cluster = cluster();
    let opts = opts(InstallType::Ingress);
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });

    let issuer = actions.iter().find_map(|a| match a {
        ReconcileAction::ApplyIssuer { email, .. } => Some(email.clone()),
        _ => None,
    });
    assert_eq!(issuer.as_deref(), Some("ops@example.com"));

    let ingress = actions.iter().find_map(|a| match a {
        ReconcileAction::ApplyIngress { shape, .. } => Some(shape.clone()),
        _ => None,
    });
    match ingress {
        Some(IngressShape::HostTls { host, tls: TlsSource::AcmeIssuer { issuer } }) => {
            assert_eq!(host, "app.example.com");
            assert_eq!(issuer, ISSUER_NAME);
        }
        other => panic!("expected host+TLS via ACME, got {other:?}"),
    }

    // Issuer must be applied before the TLS ingress that references it.
    let issuer_pos = actions
        .iter()
        .position(|a| matches!(a, ReconcileAction::ApplyIssuer { .. }))
        .unwrap();
    let ingress_pos = actions
        .iter()
        .position(|a| matches!(a, ReconcileAction::ApplyIngress { .. }))
        .unwrap();
    assert!(issuer_pos < ingress_pos);
}

#[test]
fn issued_certificate_takes_precedence_over_acme() {
    let target = target(Platform::Aws, Some("app.example.com"), Some("ops@example.com"));
    let cluster = cluster();
    let opts = opts(InstallType::Ingress);
    let cert = CertificateRef {
        arn: "arn:aws:acm:us-east-1:111122223333:certificate/abc".into(),
        domain: "app.example.com".into(),
    };
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: Some(&cert),
        infra_present: false,
        opts: &opts,
    });

    assert!(!actions.iter().any(|a| matches!(a, ReconcileAction::ApplyIssuer { .. })));
    let uses_arn = actions.iter().any(|a| {
        matches!(a, ReconcileAction::ApplyIngress {
            shape: IngressShape::HostTls { tls: TlsSource::AcmCertificate { arn }, .. }, ..
        } if arn == &cert.arn)
    });
    assert!(uses_arn);
}

#[test]
fn domain_without_email_is_http_only() {
    let target = target(Platform::Generic, Some("app.example.com"), None);
    let cluster = cluster();
    let opts = opts(InstallType::Ingress);
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });
    let shape = actions.iter().find_map(|a| match a {
        ReconcileAction::ApplyIngress { shape, .. } => Some(shape.clone()),
        _ => None,
    });
    assert_eq!(shape, Some(IngressShape::Host { host: "app.example.com".into() }));
}

#[test]
fn unset_domain_never_yields_issuer_or_tls() {
    // Property over both install types and both upgrade modes.
    for install_type in [InstallType::Ingress, InstallType::PortForward] {
        for upgrade in [false, true] {
            let target = target(Platform::Generic, None, None);
            let cluster = cluster();
            let opts = PlanOptions {
                install_type,
                use_existing_infra: false,
                upgrade,
                debug: false,
            };
            let actions = plan(&PlanInput {
                target: &target,
                cluster: &cluster,
                existing_cert: None,
                infra_present: false,
                opts: &opts,
            });
            for a in &actions {
                assert!(!matches!(a, ReconcileAction::ApplyIssuer { .. }), "{a:?}");
                if let ReconcileAction::ApplyIngress { shape, .. } = a {
                    assert!(!shape.is_tls(), "{shape:?}");
                }
            }
        }
    }
}

#[test]
fn aws_plan_provisions_infra_unless_reused() {
    let target = target(Platform::Aws, None, None);
    let cluster = cluster();
    let mut opts = opts(InstallType::PortForward);

    let fresh = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });
    assert!(matches!(&fresh[0], ReconcileAction::CreateInfra { .. }));

    opts.use_existing_infra = true;
    let reused = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: true,
        opts: &opts,
    });
    assert!(!reused.iter().any(|a| matches!(a, ReconcileAction::CreateInfra { .. })));
}

#[test]
fn upgrade_plan_restarts_pods_last() {
    let target = target(Platform::Generic, None, None);
    let cluster = cluster();
    let opts = PlanOptions {
        install_type: InstallType::PortForward,
        use_existing_infra: false,
        upgrade: true,
        debug: false,
    };
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: None,
        infra_present: false,
        opts: &opts,
    });
    assert!(matches!(&actions[0], ReconcileAction::UpgradeChart { .. }));
    assert!(matches!(
        actions.last().unwrap(),
        ReconcileAction::RestartPods { selector, .. }
            if selector == "app.kubernetes.io/instance=opencomply"
    ));
}
