//! Deployment planning: a pure function from target + cluster snapshot to an
//! ordered list of reconcile actions, plus the operator input providers.
//!
//! The branch precedence is fixed:
//! 1. existing infra + "use existing" elected -> skip infra actions
//! 2. no domain, basic install type -> no ingress actions (port-forward)
//! 3. domain with an issued provider certificate -> HTTPS via that cert
//! 4. domain + email, no certificate -> HTTPS via ACME issuance
//! 5. domain, no email -> HTTP-only custom domain
//! 6. otherwise -> hostless ingress, exposed via the controller's address

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use comply_core::{
    build_values, config, CertificateRef, ClusterContext, DeploymentTarget, IngressShape,
    InputProvider, InstallError, Platform, ReconcileAction, TlsSource,
};

pub const INGRESS_NGINX_CHART: &str = "ingress-nginx/ingress-nginx";
pub const INGRESS_NGINX_NAMESPACE: &str = "ingress-nginx";
pub const INGRESS_NGINX_RELEASE: &str = "ingress-nginx";
pub const INGRESS_NGINX_SERVICE: &str = "ingress-nginx-controller";
pub const CERT_MANAGER_CHART: &str = "jetstack/cert-manager";
pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";
pub const CERT_MANAGER_RELEASE: &str = "cert-manager";
pub const ISSUER_NAME: &str = "letsencrypt";
pub const INGRESS_CLASS: &str = "nginx";

/// How long the interactive install-type prompt waits before defaulting.
pub const INSTALL_TYPE_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// `-t/--type`: 1 = HTTPS ingress, 2 = basic (port-forward).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallType {
    Ingress,
    PortForward,
}

impl InstallType {
    pub fn from_flag(v: u8) -> Option<Self> {
        match v {
            1 => Some(InstallType::Ingress),
            2 => Some(InstallType::PortForward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub install_type: InstallType,
    pub use_existing_infra: bool,
    pub upgrade: bool,
    pub debug: bool,
}

pub struct PlanInput<'a> {
    pub target: &'a DeploymentTarget,
    pub cluster: &'a ClusterContext,
    /// Issued certificate found for the exact domain, if any.
    pub existing_cert: Option<&'a CertificateRef>,
    /// Reachable infra state was detected.
    pub infra_present: bool,
    pub opts: &'a PlanOptions,
}

/// Pure: no I/O, no prompts. Everything interactive is resolved by the
/// caller beforehand (install type, use-existing election, cert lookup).
pub fn plan(input: &PlanInput<'_>) -> Vec<ReconcileAction> {
    let target = input.target;
    let opts = input.opts;
    let namespace = config::namespace();
    let release = config::release_name();
    let mut actions = Vec::new();

    if target.platform == Platform::Aws && !(input.infra_present && opts.use_existing_infra) {
        actions.push(ReconcileAction::CreateInfra {
            platform: target.platform,
            region: target.region.clone(),
        });
    }

    let domain = target.domain.as_deref().filter(|d| !d.is_empty());
    let https = domain.is_some() && (input.existing_cert.is_some() || target.email.is_some());
    let values = build_values(domain, https, opts.debug);
    let chart = config::chart_ref();
    if opts.upgrade {
        actions.push(ReconcileAction::UpgradeChart {
            release: release.clone(),
            namespace: namespace.clone(),
            chart,
            values,
        });
    } else {
        actions.push(ReconcileAction::InstallChart {
            release: release.clone(),
            namespace: namespace.clone(),
            chart,
            values,
        });
    }

    match domain {
        None => {
            if opts.install_type == InstallType::Ingress {
                actions.push(ingress_controller_chart());
                actions.push(ReconcileAction::ApplyIngress {
                    namespace: namespace.clone(),
                    shape: IngressShape::Hostless,
                });
            }
            // Basic install: no ingress actions; the presenter recommends
            // port-forwarding instead.
        }
        Some(host) => {
            if let Some(cert) = input.existing_cert {
                // Provider-issued certificate: TLS terminates at the load
                // balancer, no issuer object needed.
                actions.push(ReconcileAction::ApplyIngress {
                    namespace: namespace.clone(),
                    shape: IngressShape::HostTls {
                        host: host.to_string(),
                        tls: TlsSource::AcmCertificate { arn: cert.arn.clone() },
                    },
                });
            } else if let Some(email) = target.email.as_deref() {
                actions.push(ingress_controller_chart());
                actions.push(cert_manager_chart());
                actions.push(ReconcileAction::ApplyIssuer {
                    name: ISSUER_NAME.to_string(),
                    email: email.to_string(),
                    ingress_class: INGRESS_CLASS.to_string(),
                });
                actions.push(ReconcileAction::ApplyIngress {
                    namespace: namespace.clone(),
                    shape: IngressShape::HostTls {
                        host: host.to_string(),
                        tls: TlsSource::AcmeIssuer { issuer: ISSUER_NAME.to_string() },
                    },
                });
            } else {
                actions.push(ingress_controller_chart());
                actions.push(ReconcileAction::ApplyIngress {
                    namespace: namespace.clone(),
                    shape: IngressShape::Host { host: host.to_string() },
                });
            }
        }
    }

    if opts.upgrade {
        // Config re-read after a configuration-affecting upgrade.
        actions.push(ReconcileAction::RestartPods {
            namespace,
            selector: format!("app.kubernetes.io/instance={release}"),
        });
    }

    debug!(actions = actions.len(), "plan computed");
    actions
}

fn ingress_controller_chart() -> ReconcileAction {
    ReconcileAction::InstallChart {
        release: INGRESS_NGINX_RELEASE.to_string(),
        namespace: INGRESS_NGINX_NAMESPACE.to_string(),
        chart: INGRESS_NGINX_CHART.to_string(),
        values: serde_json::json!({}),
    }
}

fn cert_manager_chart() -> ReconcileAction {
    ReconcileAction::InstallChart {
        release: CERT_MANAGER_RELEASE.to_string(),
        namespace: CERT_MANAGER_NAMESPACE.to_string(),
        chart: CERT_MANAGER_CHART.to_string(),
        values: serde_json::json!({ "installCRDs": true }),
    }
}

/// Resolve the install type from the flag, or ask with a bounded wait and
/// default to the basic (port-forward) flow when unanswered.
pub async fn resolve_install_type(
    flag: Option<u8>,
    input: &dyn InputProvider,
) -> anyhow::Result<InstallType> {
    if let Some(v) = flag {
        return InstallType::from_flag(v)
            .ok_or_else(|| InstallError::InvalidInput(format!("install type must be 1 or 2, got {v}")).into());
    }
    let answer = input
        .prompt_with_default(
            "Install type: 1) HTTPS ingress  2) basic (port-forward)",
            "2",
            INSTALL_TYPE_PROMPT_TIMEOUT,
        )
        .await?;
    let ty = match answer.trim() {
        "1" => InstallType::Ingress,
        _ => InstallType::PortForward,
    };
    info!(?ty, "install type resolved");
    Ok(ty)
}

/// Interactive provider reading answers from stdin.
pub struct TerminalInput;

#[async_trait::async_trait]
impl InputProvider for TerminalInput {
    async fn prompt_with_default(
        &self,
        question: &str,
        default: &str,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        eprint!("{question} [{default}]: ");
        let read = tokio::time::timeout(timeout, async {
            let mut line = String::new();
            let mut reader = BufReader::new(tokio::io::stdin());
            let n = reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>((n, line))
        })
        .await;
        match read {
            // Timeout or closed stdin: fall back to the default.
            Err(_) => {
                eprintln!();
                info!(default, "no answer within {}s; using default", timeout.as_secs());
                Ok(default.to_string())
            }
            Ok(Ok((0, _))) => Ok(default.to_string()),
            Ok(Ok((_, line))) => {
                let t = line.trim();
                Ok(if t.is_empty() { default.to_string() } else { t.to_string() })
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn confirm(&self, question: &str, default: bool) -> anyhow::Result<bool> {
        let hint = if default { "Y/n" } else { "y/N" };
        let fallback = if default { "y" } else { "n" };
        let answer = self
            .prompt_with_default(&format!("{question} ({hint})"), fallback, Duration::from_secs(300))
            .await?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// Non-interactive provider: prompts resolve to their defaults;
/// confirmations to `assume_yes` or the (destructive-safe) default.
pub struct AssumeDefaults {
    pub assume_yes: bool,
}

#[async_trait::async_trait]
impl InputProvider for AssumeDefaults {
    async fn prompt_with_default(
        &self,
        _question: &str,
        default: &str,
        _timeout: Duration,
    ) -> anyhow::Result<String> {
        Ok(default.to_string())
    }

    async fn confirm(&self, _question: &str, default: bool) -> anyhow::Result<bool> {
        Ok(self.assume_yes || default)
    }
}

/// Scripted provider for tests: pops pre-seeded answers, falls back to the
/// default when exhausted.
pub struct ScriptedInput {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedInput {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait::async_trait]
impl InputProvider for ScriptedInput {
    async fn prompt_with_default(
        &self,
        _question: &str,
        default: &str,
        _timeout: Duration,
    ) -> anyhow::Result<String> {
        let popped = self.answers.lock().expect("poisoned").pop_front();
        Ok(popped.unwrap_or_else(|| default.to_string()))
    }

    async fn confirm(&self, question: &str, default: bool) -> anyhow::Result<bool> {
        let answer = self.prompt_with_default(question, "", Duration::ZERO).await?;
        match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            _ => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_type_flag_values() {
        assert_eq!(InstallType::from_flag(1), Some(InstallType::Ingress));
        assert_eq!(InstallType::from_flag(2), Some(InstallType::PortForward));
        assert_eq!(InstallType::from_flag(3), None);
    }

    #[tokio::test]
    async fn install_type_defaults_to_port_forward() {
        let input = AssumeDefaults { assume_yes: false };
        let ty = resolve_install_type(None, &input).await.unwrap();
        assert_eq!(ty, InstallType::PortForward);
    }

    #[tokio::test]
    async fn install_type_answered_interactively() {
        let input = ScriptedInput::new(&["1"]);
        let ty = resolve_install_type(None, &input).await.unwrap();
        assert_eq!(ty, InstallType::Ingress);
    }

    #[tokio::test]
    async fn install_type_rejects_bad_flag() {
        let input = AssumeDefaults { assume_yes: false };
        let err = resolve_install_type(Some(7), &input).await.unwrap_err();
        let ie = err.downcast_ref::<InstallError>().unwrap();
        assert_eq!(ie.category(), "invalid-input");
    }

    #[tokio::test]
    async fn scripted_confirmations() {
        let input = ScriptedInput::new(&["y", "no"]);
        assert!(input.confirm("a", false).await.unwrap());
        assert!(!input.confirm("b", true).await.unwrap());
        // exhausted -> default
        assert!(input.confirm("c", true).await.unwrap());
    }

    #[tokio::test]
    async fn assume_yes_only_flips_confirmations() {
        let input = AssumeDefaults { assume_yes: true };
        assert!(input.confirm("destroy?", false).await.unwrap());
        let cautious = AssumeDefaults { assume_yes: false };
        assert!(!cautious.confirm("destroy?", false).await.unwrap());
    }
}
