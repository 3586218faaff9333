//! Chart release reconciliation through the helm CLI: install when absent,
//! no-op when healthy, offered upgrade when a newer chart exists, confirmed
//! uninstall-then-reinstall when unhealthy.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{info, warn};

use comply_cluster::{cmd, helm_releases};
use comply_core::{config, InstallError, ReconcileResult, ReleaseStatus};

use crate::ReconcileCtx;

/// Map a `repo/chart` reference to the repository it comes from.
fn repo_for(chart: &str) -> Option<(&str, String)> {
    match chart.split_once('/').map(|(repo, _)| repo) {
        Some("opencomply") => Some(("opencomply", config::chart_repo())),
        Some("ingress-nginx") => {
            Some(("ingress-nginx", "https://kubernetes.github.io/ingress-nginx".to_string()))
        }
        Some("jetstack") => Some(("jetstack", "https://charts.jetstack.io".to_string())),
        _ => None,
    }
}

async fn ensure_repo(chart: &str) -> Result<()> {
    if let Some((name, url)) = repo_for(chart) {
        cmd::run("helm", &["repo", "add", name, &url, "--force-update"]).await?;
        cmd::run("helm", &["repo", "update", name]).await?;
    }
    Ok(())
}

fn write_values(values: &Json) -> Result<PathBuf> {
    let yaml = serde_yaml::to_string(values).context("rendering values to YAML")?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("complyctl-values-{nanos}.yaml"));
    std::fs::write(&path, yaml)
        .with_context(|| format!("writing values file {}", path.display()))?;
    Ok(path)
}

async fn helm_with_values(
    subcommand: &str,
    release: &str,
    namespace: &str,
    chart: &str,
    values: &Json,
    extra: &[&str],
) -> Result<()> {
    let path = write_values(values)?;
    let path_s = path.to_string_lossy().to_string();
    let mut args = vec![subcommand, release, chart, "-n", namespace, "-f", path_s.as_str()];
    args.extend_from_slice(extra);
    let res = cmd::run("helm", &args).await;
    let _ = std::fs::remove_file(&path);
    res.map(|_| ()).map_err(Into::into)
}

pub async fn install(release: &str, namespace: &str, chart: &str, values: &Json) -> Result<()> {
    helm_with_values("install", release, namespace, chart, values, &["--create-namespace"]).await
}

pub async fn upgrade(release: &str, namespace: &str, chart: &str, values: &Json) -> Result<()> {
    helm_with_values("upgrade", release, namespace, chart, values, &[]).await
}

pub async fn uninstall(release: &str, namespace: &str) -> Result<()> {
    cmd::run("helm", &["uninstall", release, "-n", namespace])
        .await
        .map(|_| ())
        .map_err(Into::into)
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRow {
    name: String,
    version: String,
}

/// Newest chart version in the repo index, if the chart is listed.
pub async fn latest_version(chart: &str) -> Result<Option<String>> {
    let out = cmd::run("helm", &["search", "repo", chart, "-o", "json"]).await?;
    let rows: Vec<SearchRow> = serde_json::from_str(&out).context("parsing helm search output")?;
    Ok(rows.into_iter().find(|r| r.name == chart).map(|r| r.version))
}

/// Lexicographically-safe semver comparison on `major.minor.patch` prefixes.
pub fn version_newer(candidate: &str, current: &str) -> bool {
    fn key(v: &str) -> (u64, u64, u64) {
        let mut parts = v
            .trim_start_matches('v')
            .split(|c: char| c == '.' || c == '-' || c == '+')
            .map_while(|p| p.parse::<u64>().ok());
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }
    key(candidate) > key(current)
}

/// Install path: absent -> install; healthy -> no-op unless a newer chart is
/// offered and accepted; unhealthy -> confirmed uninstall-then-reinstall.
pub async fn reconcile_install(
    ctx: &ReconcileCtx<'_>,
    release: &str,
    namespace: &str,
    chart: &str,
    values: &Json,
) -> Result<ReconcileResult> {
    let releases = helm_releases(namespace).await?;
    let current = releases.iter().find(|r| r.name == release);
    let status = current.map(|r| r.status).unwrap_or(ReleaseStatus::Absent);

    match status {
        ReleaseStatus::Absent => {
            ensure_repo(chart).await?;
            install(release, namespace, chart, values).await?;
            Ok(ReconcileResult::changed(format!("installed {release} in {namespace}")))
        }
        ReleaseStatus::Deployed => {
            ensure_repo(chart).await?;
            let installed = current.and_then(|r| r.chart_version.clone());
            if let (Some(latest), Some(installed)) = (latest_version(chart).await?, installed) {
                if version_newer(&latest, &installed) {
                    let question =
                        format!("{release} {installed} is installed; upgrade to {latest}?");
                    if ctx.input.confirm(&question, true).await? {
                        upgrade(release, namespace, chart, values).await?;
                        return Ok(ReconcileResult::changed(format!(
                            "upgraded {release} to {latest}"
                        )));
                    }
                }
            }
            Ok(ReconcileResult::no_op(format!("{release} healthy, nothing to do")))
        }
        ReleaseStatus::Pending => {
            warn!(release, "release has an operation in progress; leaving it alone");
            Ok(ReconcileResult::no_op(format!("{release} pending")))
        }
        ReleaseStatus::Failed => {
            let question = format!(
                "release {release} in {namespace} is unhealthy; uninstall and reinstall? \
                 This deletes its resources and cannot be undone"
            );
            if !ctx.input.confirm(&question, false).await? {
                return Err(InstallError::Aborted.into());
            }
            uninstall(release, namespace).await?;
            ensure_repo(chart).await?;
            install(release, namespace, chart, values).await?;
            Ok(ReconcileResult::changed(format!("reinstalled {release}")))
        }
    }
}

/// Upgrade path: upgrade in place, installing first if nothing is there.
pub async fn reconcile_upgrade(
    release: &str,
    namespace: &str,
    chart: &str,
    values: &Json,
) -> Result<ReconcileResult> {
    let releases = helm_releases(namespace).await?;
    let present = releases.iter().any(|r| r.name == release);
    ensure_repo(chart).await?;
    if present {
        upgrade(release, namespace, chart, values).await?;
        Ok(ReconcileResult::changed(format!("upgraded {release}")))
    } else {
        info!(release, "nothing to upgrade; installing fresh");
        install(release, namespace, chart, values).await?;
        Ok(ReconcileResult::changed(format!("installed {release}")))
    }
}
