//! Infrastructure actions through the IaC engine (tofu/terraform). The apply
//! runs as a background child process while a polling loop samples completed
//! resource count and reports progress; destroy requires confirmation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use comply_cluster::cmd;
use comply_core::{config, InstallError, ProgressSample, ReconcileResult};

use crate::ReconcileCtx;

fn infra_dir() -> PathBuf {
    PathBuf::from(config::infra_dir())
}

/// A missing module directory would otherwise surface as the engine binary
/// "not found" when the spawn fails.
fn require_infra_dir(dir: &Path) -> Result<(), InstallError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(InstallError::InvalidInput(format!(
            "infrastructure directory {} does not exist",
            dir.display()
        )))
    }
}

/// Existing reachable state? Read-only; a missing or uninitialized backend
/// is simply "no state", not an error.
pub async fn state_present(engine: comply_core::IacEngine) -> Result<bool> {
    let dir = infra_dir();
    if !dir.exists() {
        return Ok(false);
    }
    match cmd::run_in(Some(&dir), engine.binary(), &["state", "list", "-no-color"]).await {
        Ok(out) => Ok(!out.trim().is_empty()),
        Err(e) => {
            debug!(error = %e, "state list failed; treating as no existing state");
            Ok(false)
        }
    }
}

/// "Plan: 12 to add, 0 to change, 0 to destroy." -> 12
pub fn parse_plan_total(plan_output: &str) -> Option<usize> {
    for line in plan_output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Plan:") {
            let first = rest.trim().split_whitespace().next()?;
            return first.parse().ok();
        }
    }
    None
}

pub fn is_resource_complete_line(line: &str) -> bool {
    line.contains(": Creation complete") || line.contains(": Destruction complete")
}

pub async fn create(ctx: &ReconcileCtx<'_>, region: Option<&str>) -> Result<ReconcileResult> {
    let dir = infra_dir();
    require_infra_dir(&dir)?;
    let bin = ctx.engine.binary();
    info!(engine = bin, dir = %dir.display(), "provisioning infrastructure");

    cmd::run_in(Some(&dir), bin, &["init", "-input=false", "-no-color"]).await?;

    let region_var;
    let mut plan_args = vec!["plan", "-input=false", "-no-color", "-out", "tfplan"];
    if let Some(r) = region {
        region_var = format!("region={r}");
        plan_args.extend_from_slice(&["-var", &region_var]);
    }
    let plan_out = cmd::run_in(Some(&dir), bin, &plan_args).await?;
    let total = parse_plan_total(&plan_out).unwrap_or(0);
    if total == 0 {
        return Ok(ReconcileResult::no_op("infrastructure already up to date"));
    }
    info!(total, "applying infrastructure plan");

    let mut child = tokio::process::Command::new(bin)
        .args(["apply", "-input=false", "-no-color", "-auto-approve", "tfplan"])
        .current_dir(&dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {bin} apply"))?;

    let completed = Arc::new(AtomicUsize::new(0));
    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;

    let counter = completed.clone();
    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_resource_complete_line(&line) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!(target: "infra", "{line}");
        }
    });
    let err_task = tokio::spawn(async move {
        let mut buf = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "infra", "{line}");
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let status = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                warn!("interrupt during infrastructure apply; killing child");
                let _ = child.kill().await;
                return Err(InstallError::Aborted.into());
            }
            status = child.wait() => break status.context("waiting for apply")?,
            _ = ticker.tick() => {
                if let Some(tx) = &ctx.progress {
                    let sample = ProgressSample {
                        completed: completed.load(Ordering::Relaxed),
                        total,
                    };
                    let _ = tx.send(sample).await;
                }
            }
        }
    };

    let _ = out_task.await;
    let stderr_text = err_task.await.unwrap_or_default();
    if !status.success() {
        return Err(InstallError::ExternalAction {
            tool: bin.to_string(),
            detail: stderr_text.trim().to_string(),
        }
        .into());
    }
    if let Some(tx) = &ctx.progress {
        let _ = tx.send(ProgressSample { completed: total, total }).await;
    }
    Ok(ReconcileResult::changed(format!("{total} resource(s) applied")))
}

/// Enumerate existing state, confirm, then destroy. Declining aborts.
pub async fn destroy(ctx: &ReconcileCtx<'_>) -> Result<ReconcileResult> {
    let dir = infra_dir();
    let bin = ctx.engine.binary();
    let state = match cmd::run_in(Some(&dir), bin, &["state", "list", "-no-color"]).await {
        Ok(out) => out,
        Err(_) => return Ok(ReconcileResult::no_op("no infrastructure state to destroy")),
    };
    let count = state.lines().filter(|l| !l.trim().is_empty()).count();
    if count == 0 {
        return Ok(ReconcileResult::no_op("no infrastructure state to destroy"));
    }
    let question = format!("Destroy {count} managed resource(s)? This cannot be undone");
    if !ctx.input.confirm(&question, false).await? {
        return Err(InstallError::Aborted.into());
    }
    cmd::run_in(
        Some(&dir),
        bin,
        &["destroy", "-input=false", "-no-color", "-auto-approve"],
    )
    .await?;
    Ok(ReconcileResult::changed(format!("{count} resource(s) destroyed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_totals_parse() {
        let out = "\nTerraform will perform the following actions:\n\n\
                   Plan: 12 to add, 0 to change, 0 to destroy.\n";
        assert_eq!(parse_plan_total(out), Some(12));
        assert_eq!(parse_plan_total("No changes. Infrastructure is up-to-date."), None);
    }

    #[test]
    fn missing_infra_dir_is_invalid_input_not_missing_tool() {
        let err = require_infra_dir(Path::new("/definitely/not/a/real/dir")).unwrap_err();
        assert_eq!(err.category(), "invalid-input");
        assert!(err.to_string().contains("/definitely/not/a/real/dir"));

        require_infra_dir(&std::env::temp_dir()).unwrap();
    }

    #[test]
    fn completion_lines_detected() {
        assert!(is_resource_complete_line(
            "aws_eks_cluster.this: Creation complete after 9m2s [id=opencomply]"
        ));
        assert!(is_resource_complete_line(
            "aws_iam_role.node: Destruction complete after 1s"
        ));
        assert!(!is_resource_complete_line("aws_eks_cluster.this: Still creating... [4m0s]"));
    }
}
