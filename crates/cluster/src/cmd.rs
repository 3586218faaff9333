//! Thin async wrapper over external CLI tools. Nonzero exit surfaces the
//! tool's own stderr; a missing binary maps to `ToolMissing`.

use std::path::Path;

use tracing::debug;

use comply_core::InstallError;

pub async fn run(bin: &str, args: &[&str]) -> Result<String, InstallError> {
    run_in(None, bin, args).await
}

pub async fn run_in(dir: Option<&Path>, bin: &str, args: &[&str]) -> Result<String, InstallError> {
    debug!(tool = bin, ?args, cwd = ?dir, "exec");
    let mut command = tokio::process::Command::new(bin);
    command.args(args);
    if let Some(d) = dir {
        command.current_dir(d);
    }
    let out = command.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            InstallError::ToolMissing(bin.to_string())
        } else {
            InstallError::ExternalAction { tool: bin.to_string(), detail: e.to_string() }
        }
    })?;
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.trim().is_empty() {
        debug!(tool = bin, stderr = %stderr.trim(), "tool diagnostics");
    }
    if !out.status.success() {
        return Err(InstallError::ExternalAction {
            tool: bin.to_string(),
            detail: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}
