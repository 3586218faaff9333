//! Defaults and env-var tunables. Every constant here can be overridden via
//! a `COMPLY_*` variable; the defaults match the documented install flow.

use std::time::Duration;

use crate::PollPolicy;

pub const DEFAULT_NAMESPACE: &str = "opencomply";
pub const DEFAULT_RELEASE: &str = "opencomply";
pub const DEFAULT_CHART_REPO: &str = "https://charts.opencomply.io";
pub const DEFAULT_CHART: &str = "opencomply/opencomply";

/// Service the ingress (and the port-forward fallback) routes to.
pub const APP_SERVICE: &str = "opencomply-proxy";
pub const APP_SERVICE_PORT: u16 = 80;
pub const PORT_FORWARD_LOCAL_PORT: u16 = 8080;

/// Fixed first-login identity. Documented caveat, not a secret.
pub const DEFAULT_LOGIN: &str = "admin@opencomply.io";
pub const DEFAULT_PASSWORD: &str = "password";

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).ok().unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn namespace() -> String {
    env_str("COMPLY_NAMESPACE", DEFAULT_NAMESPACE)
}

pub fn release_name() -> String {
    env_str("COMPLY_RELEASE", DEFAULT_RELEASE)
}

pub fn chart_repo() -> String {
    env_str("COMPLY_CHART_REPO", DEFAULT_CHART_REPO)
}

pub fn chart_ref() -> String {
    env_str("COMPLY_CHART", DEFAULT_CHART)
}

/// One-shot schema/data migration job the app ships; must complete before
/// the release is considered ready.
pub fn migrator_job() -> String {
    env_str("COMPLY_MIGRATOR_JOB", "opencomply-migrator")
}

/// Directory holding the infrastructure-as-code root module.
pub fn infra_dir() -> String {
    env_str("COMPLY_INFRA_DIR", "infra")
}

/// Minimum ready nodes the prerequisite gate requires.
pub fn min_ready_nodes() -> usize {
    env_u64("COMPLY_MIN_NODES", 3) as usize
}

fn policy(timeout_key: &str, timeout_default: u64, interval_key: &str, interval_default: u64) -> PollPolicy {
    PollPolicy {
        timeout: Duration::from_secs(env_u64(timeout_key, timeout_default)),
        interval: Duration::from_secs(env_u64(interval_key, interval_default)),
    }
}

pub fn pod_ready() -> PollPolicy {
    policy("COMPLY_POD_TIMEOUT_SECS", 720, "COMPLY_POD_POLL_SECS", 15)
}

pub fn migration_job() -> PollPolicy {
    policy("COMPLY_JOB_TIMEOUT_SECS", 720, "COMPLY_JOB_POLL_SECS", 30)
}

pub fn external_address() -> PollPolicy {
    policy("COMPLY_ADDR_TIMEOUT_SECS", 360, "COMPLY_ADDR_POLL_SECS", 15)
}

pub fn issuer_ready() -> PollPolicy {
    policy("COMPLY_ISSUER_TIMEOUT_SECS", 360, "COMPLY_ISSUER_POLL_SECS", 10)
}
