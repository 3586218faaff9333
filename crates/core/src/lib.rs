//! Core types for the OpenComply deployment orchestrator: the immutable
//! context structs threaded through the install stages, the reconcile action
//! model, and the error taxonomy.

#![forbid(unsafe_code)]

pub mod config;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Target platform the installer provisions onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Aws,
    DigitalOcean,
    Generic,
}

/// Provider backing the currently configured cluster context, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterProvider {
    Aws,
    Other,
    None,
}

/// Health of a chart release as reported by the package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    Deployed,
    Pending,
    Failed,
    Absent,
}

/// A named, versioned deployment of a chart onto a cluster namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub namespace: String,
    pub chart_version: Option<String>,
    pub status: ReleaseStatus,
}

/// Snapshot of the target cluster. Produced by probing; never written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterContext {
    pub provider: ClusterProvider,
    pub ready_nodes: usize,
    pub releases: Vec<ReleaseRef>,
}

/// What the operator asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub platform: Platform,
    pub domain: Option<String>,
    pub email: Option<String>,
    pub use_https: bool,
    pub region: Option<String>,
}

impl DeploymentTarget {
    pub fn validate(&self) -> Result<(), InstallError> {
        if let Some(d) = self.domain.as_deref() {
            if !valid_domain(d) {
                return Err(InstallError::InvalidInput(format!("malformed domain: {d}")));
            }
        }
        if let Some(e) = self.email.as_deref() {
            if !valid_email(e) {
                return Err(InstallError::InvalidInput(format!("malformed email: {e}")));
            }
        }
        if self.use_https && self.domain.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(InstallError::InvalidInput(
                "HTTPS requires a domain".to_string(),
            ));
        }
        Ok(())
    }
}

/// DNS label rules, enough to reject obvious garbage before any mutation.
pub fn valid_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 || !s.contains('.') {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub fn valid_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && valid_domain(domain),
        None => false,
    }
}

/// An issued certificate found in the provider's certificate store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRef {
    pub arn: String,
    pub domain: String,
}

/// Where the TLS material for a host+TLS ingress comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsSource {
    /// A pre-issued provider certificate, referenced by ARN.
    AcmCertificate { arn: String },
    /// ACME issuance through a cluster issuer object.
    AcmeIssuer { issuer: String },
}

/// The three ingress shapes the installer knows how to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressShape {
    Hostless,
    Host { host: String },
    HostTls { host: String, tls: TlsSource },
}

impl IngressShape {
    pub fn host(&self) -> Option<&str> {
        match self {
            IngressShape::Hostless => None,
            IngressShape::Host { host } | IngressShape::HostTls { host, .. } => Some(host),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, IngressShape::HostTls { .. })
    }
}

/// One step of the reconcile plan. Every variant is safe to re-run: applying
/// an already-satisfied desired state is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconcileAction {
    CreateInfra {
        platform: Platform,
        region: Option<String>,
    },
    DestroyInfra {
        platform: Platform,
    },
    InstallChart {
        release: String,
        namespace: String,
        chart: String,
        values: serde_json::Value,
    },
    UpgradeChart {
        release: String,
        namespace: String,
        chart: String,
        values: serde_json::Value,
    },
    ApplyIngress {
        namespace: String,
        shape: IngressShape,
    },
    ApplyIssuer {
        name: String,
        email: String,
        ingress_class: String,
    },
    RestartPods {
        namespace: String,
        selector: String,
    },
}

impl ReconcileAction {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ReconcileAction::CreateInfra { .. } => "create-infra",
            ReconcileAction::DestroyInfra { .. } => "destroy-infra",
            ReconcileAction::InstallChart { .. } => "install-chart",
            ReconcileAction::UpgradeChart { .. } => "upgrade-chart",
            ReconcileAction::ApplyIngress { .. } => "apply-ingress",
            ReconcileAction::ApplyIssuer { .. } => "apply-issuer",
            ReconcileAction::RestartPods { .. } => "restart-pods",
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            ReconcileAction::CreateInfra { platform, .. }
            | ReconcileAction::DestroyInfra { platform } => {
                format!("{}/{:?}", self.kind_str(), platform)
            }
            ReconcileAction::InstallChart {
                release, namespace, ..
            }
            | ReconcileAction::UpgradeChart {
                release, namespace, ..
            } => format!("{}/{}/{}", self.kind_str(), namespace, release),
            ReconcileAction::ApplyIngress { namespace, .. } => {
                format!("{}/{}", self.kind_str(), namespace)
            }
            ReconcileAction::ApplyIssuer { name, .. } => {
                format!("{}/{}", self.kind_str(), name)
            }
            ReconcileAction::RestartPods {
                namespace, selector, ..
            } => format!("{}/{}/{}", self.kind_str(), namespace, selector),
        }
    }
}

/// Outcome of one reconcile step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub applied: bool,
    pub detail: String,
}

impl ReconcileResult {
    pub fn no_op(detail: impl Into<String>) -> Self {
        Self { applied: false, detail: detail.into() }
    }

    pub fn changed(detail: impl Into<String>) -> Self {
        Self { applied: true, detail: detail.into() }
    }
}

/// Ephemeral progress sample from a background apply, consumed by the presenter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressSample {
    pub completed: usize,
    pub total: usize,
}

impl ProgressSample {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            return 0;
        }
        (self.completed * 100 / self.total).min(100)
    }
}

/// Infrastructure-as-code engine available on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IacEngine {
    Tofu,
    Terraform,
}

impl IacEngine {
    pub fn binary(&self) -> &'static str {
        match self {
            IacEngine::Tofu => "tofu",
            IacEngine::Terraform => "terraform",
        }
    }
}

/// Interval/timeout pair for one readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Error taxonomy for the whole orchestrator. Every failure maps to exit 1;
/// the variant only drives the categorized message.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("cluster unsuitable: {0}")]
    UnsuitableCluster(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{tool} failed: {detail}")]
    ExternalAction { tool: String, detail: String },
    #[error("timed out waiting for {what}; last observed: {last}")]
    Timeout { what: String, last: String },
    #[error("aborted by operator")]
    Aborted,
}

impl InstallError {
    pub fn category(&self) -> &'static str {
        match self {
            InstallError::ToolMissing(_) => "missing-tool",
            InstallError::AuthFailed(_) => "auth",
            InstallError::UnsuitableCluster(_) => "unsuitable-cluster",
            InstallError::InvalidInput(_) => "invalid-input",
            InstallError::ExternalAction { .. } => "external-action",
            InstallError::Timeout { .. } => "timeout",
            InstallError::Aborted => "aborted",
        }
    }
}

/// Operator input seam: interactive prompts with a timeout and a
/// default-on-timeout policy, injectable for non-interactive runs and tests.
#[async_trait::async_trait]
pub trait InputProvider: Send + Sync {
    /// Ask a free-form question; returns `default` when the operator does not
    /// answer within `timeout` (or stdin is closed).
    async fn prompt_with_default(
        &self,
        question: &str,
        default: &str,
        timeout: Duration,
    ) -> anyhow::Result<String>;

    /// Yes/no confirmation. Destructive actions pass `default = false`.
    async fn confirm(&self, question: &str, default: bool) -> anyhow::Result<bool>;
}

/// Render the values payload handed to the chart. The dex issuer is always
/// `{protocol}://{domain}/dex` when a domain is configured.
pub fn build_values(domain: Option<&str>, https: bool, debug: bool) -> serde_json::Value {
    let mut root = serde_json::json!({ "global": { "debugMode": debug } });
    if let Some(d) = domain {
        let proto = if https { "https" } else { "http" };
        root["global"]["domain"] = serde_json::json!(d);
        root["dex"] = serde_json::json!({
            "config": { "issuer": format!("{proto}://{d}/dex") }
        });
    }
    root
}
