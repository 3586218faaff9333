//! Environment probing and prerequisite gating: kube client bootstrap, tool
//! and auth checks, typed node queries, and helm release listing.

#![forbid(unsafe_code)]

pub mod cmd;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::{api::ListParams, Api, Client};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info, warn};

use comply_core::{config, ClusterContext, ClusterProvider, IacEngine, InstallError, Platform, ReleaseRef, ReleaseStatus};

/// Build a client from the ambient kubeconfig/context.
pub async fn kube_client() -> Result<Client> {
    Client::try_default()
        .await
        .context("building kube client (is a kubeconfig configured?)")
}

/// Read-only identity check against the kube API.
pub async fn probe_kube_auth(client: &Client) -> Result<String, InstallError> {
    match client.apiserver_version().await {
        Ok(info) => Ok(format!("{}.{}", info.major, info.minor)),
        Err(e) => Err(InstallError::AuthFailed(format!(
            "kube API not reachable: {e}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

/// `tool --version`-equivalent probe. Read-only.
pub async fn probe_tool(name: &str, args: &[&str]) -> Result<ToolInfo, InstallError> {
    match cmd::run(name, args).await {
        Ok(out) => {
            let version = out.lines().next().unwrap_or("").trim().to_string();
            debug!(tool = name, %version, "tool present");
            Ok(ToolInfo { name: name.to_string(), version })
        }
        Err(_) => Err(InstallError::ToolMissing(name.to_string())),
    }
}

/// Probe the tools the chosen platform needs. Fails fast on the first miss.
pub async fn probe_required_tools(platform: Platform) -> Result<Vec<ToolInfo>, InstallError> {
    let mut tools = vec![probe_tool("helm", &["version", "--short"]).await?];
    if platform == Platform::Aws {
        tools.push(probe_tool("aws", &["--version"]).await?);
    }
    Ok(tools)
}

/// Prefer OpenTofu when both engines are installed.
pub async fn detect_iac_engine() -> Result<IacEngine, InstallError> {
    if probe_tool("tofu", &["version"]).await.is_ok() {
        return Ok(IacEngine::Tofu);
    }
    if probe_tool("terraform", &["version"]).await.is_ok() {
        return Ok(IacEngine::Terraform);
    }
    Err(InstallError::ToolMissing("tofu or terraform".to_string()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsIdentity {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Arn")]
    pub arn: String,
}

/// `aws sts get-caller-identity`, parsed. Read-only.
pub async fn probe_aws_identity() -> Result<AwsIdentity, InstallError> {
    let out = cmd::run("aws", &["sts", "get-caller-identity", "--output", "json"])
        .await
        .map_err(|e| InstallError::AuthFailed(e.to_string()))?;
    serde_json::from_str(&out)
        .map_err(|e| InstallError::AuthFailed(format!("unexpected sts output: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
struct HelmListRow {
    name: String,
    namespace: String,
    status: String,
    chart: String,
}

/// Releases in a namespace. Helm has no API server; `-o json` is its
/// structured interface, deserialized into typed rows here.
pub async fn helm_releases(namespace: &str) -> Result<Vec<ReleaseRef>> {
    let out = cmd::run("helm", &["list", "-n", namespace, "-o", "json"]).await?;
    parse_helm_list(&out)
}

pub fn parse_helm_list(json: &str) -> Result<Vec<ReleaseRef>> {
    let rows: Vec<HelmListRow> = serde_json::from_str(json).context("parsing helm list output")?;
    Ok(rows
        .into_iter()
        .map(|r| ReleaseRef {
            chart_version: chart_version_of(&r.chart),
            status: parse_release_status(&r.status),
            name: r.name,
            namespace: r.namespace,
        })
        .collect())
}

/// "opencomply-1.2.3" -> "1.2.3"
pub fn chart_version_of(chart: &str) -> Option<String> {
    chart
        .rsplit_once('-')
        .map(|(_, v)| v.to_string())
        .filter(|v| v.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
}

fn parse_release_status(s: &str) -> ReleaseStatus {
    let s = s.to_ascii_lowercase();
    if s == "deployed" {
        ReleaseStatus::Deployed
    } else if s.starts_with("pending") || s == "uninstalling" {
        ReleaseStatus::Pending
    } else {
        ReleaseStatus::Failed
    }
}

pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn detect_provider(nodes: &[Node]) -> ClusterProvider {
    if nodes.is_empty() {
        return ClusterProvider::None;
    }
    let aws = nodes.iter().any(|n| {
        n.spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .map(|p| p.starts_with("aws://"))
            .unwrap_or(false)
    });
    if aws {
        ClusterProvider::Aws
    } else {
        ClusterProvider::Other
    }
}

/// Snapshot the cluster: provider, ready nodes, releases in the namespace.
pub async fn probe_cluster(client: &Client, namespace: &str) -> Result<ClusterContext> {
    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context("listing nodes")?;
    let ready_nodes = nodes.items.iter().filter(|n| node_ready(n)).count();
    let provider = detect_provider(&nodes.items);
    let releases = helm_releases(namespace).await?;
    counter!("probe_cluster_total", 1u64);
    info!(?provider, ready_nodes, releases = releases.len(), "cluster probed");
    Ok(ClusterContext { provider, ready_nodes, releases })
}

pub mod gate {
    use super::*;

    /// Pure suitability check: enough ready nodes, and no live release of the
    /// same name already occupying the target namespace.
    pub fn check(ctx: &ClusterContext, namespace: &str, release: &str) -> Result<(), InstallError> {
        let min = config::min_ready_nodes();
        if ctx.ready_nodes < min {
            return Err(InstallError::UnsuitableCluster(format!(
                "{} ready node(s), need at least {min}",
                ctx.ready_nodes
            )));
        }
        if let Some(r) = ctx.releases.iter().find(|r| {
            r.namespace == namespace
                && r.name == release
                && matches!(r.status, ReleaseStatus::Deployed | ReleaseStatus::Pending)
        }) {
            return Err(InstallError::UnsuitableCluster(format!(
                "release {} already {:?} in namespace {}",
                r.name, r.status, r.namespace
            )));
        }
        Ok(())
    }

    /// Check, and on violation unset the ambient cluster context so a
    /// re-run cannot double-install against the wrong cluster.
    pub async fn enforce(
        ctx: &ClusterContext,
        namespace: &str,
        release: &str,
    ) -> Result<(), InstallError> {
        match check(ctx, namespace, release) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "cluster failed prerequisite gate; clearing current kube context");
                if let Err(ce) = clear_current_context().await {
                    warn!(error = %ce, "could not clear kube context");
                }
                Err(e)
            }
        }
    }

    pub async fn clear_current_context() -> Result<(), InstallError> {
        cmd::run("kubectl", &["config", "unset", "current-context"])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ready: bool, provider_id: Option<&str>) -> Node {
        let status = if ready { "True" } else { "False" };
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "n" },
            "spec": { "providerID": provider_id },
            "status": { "conditions": [ { "type": "Ready", "status": status } ] }
        }))
        .unwrap()
    }

    #[test]
    fn node_readiness_and_provider_detection() {
        let nodes = vec![
            node(true, Some("aws:///us-east-1a/i-abc")),
            node(false, Some("aws:///us-east-1b/i-def")),
        ];
        assert!(node_ready(&nodes[0]));
        assert!(!node_ready(&nodes[1]));
        assert_eq!(detect_provider(&nodes), ClusterProvider::Aws);
        assert_eq!(detect_provider(&[node(true, None)]), ClusterProvider::Other);
        assert_eq!(detect_provider(&[]), ClusterProvider::None);
    }

    #[test]
    fn helm_list_rows_become_release_refs() {
        let json = r#"[
            {"name":"opencomply","namespace":"opencomply","revision":"2",
             "updated":"2026-01-01","status":"deployed","chart":"opencomply-1.4.2","app_version":"v1.4.2"},
            {"name":"broken","namespace":"opencomply","revision":"1",
             "updated":"2026-01-01","status":"failed","chart":"other-0.1.0","app_version":""}
        ]"#;
        let refs = parse_helm_list(json).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].status, ReleaseStatus::Deployed);
        assert_eq!(refs[0].chart_version.as_deref(), Some("1.4.2"));
        assert_eq!(refs[1].status, ReleaseStatus::Failed);
    }

    #[test]
    fn chart_version_parsing() {
        assert_eq!(chart_version_of("opencomply-1.2.3").as_deref(), Some("1.2.3"));
        assert_eq!(chart_version_of("ingress-nginx-4.10.0").as_deref(), Some("4.10.0"));
        assert_eq!(chart_version_of("no-version-here"), None);
    }

    #[test]
    fn gate_rejects_few_nodes() {
        let ctx = ClusterContext {
            provider: ClusterProvider::Other,
            ready_nodes: 1,
            releases: vec![],
        };
        let err = gate::check(&ctx, "opencomply", "opencomply").unwrap_err();
        assert_eq!(err.category(), "unsuitable-cluster");
    }

    #[test]
    fn gate_rejects_conflicting_release() {
        // A healthy release already in the target namespace must stop the
        // install before any mutation.
        let ctx = ClusterContext {
            provider: ClusterProvider::Aws,
            ready_nodes: 3,
            releases: vec![ReleaseRef {
                name: "opencomply".into(),
                namespace: "opencomply".into(),
                chart_version: Some("1.0.0".into()),
                status: ReleaseStatus::Deployed,
            }],
        };
        let err = gate::check(&ctx, "opencomply", "opencomply").unwrap_err();
        assert_eq!(err.category(), "unsuitable-cluster");
    }

    #[test]
    fn gate_ignores_failed_release_and_other_namespaces() {
        let mut ctx = ClusterContext {
            provider: ClusterProvider::Aws,
            ready_nodes: 3,
            releases: vec![ReleaseRef {
                name: "opencomply".into(),
                namespace: "opencomply".into(),
                chart_version: None,
                status: ReleaseStatus::Failed,
            }],
        };
        // Failed releases are handled by the reconciler, not the gate.
        gate::check(&ctx, "opencomply", "opencomply").unwrap();

        ctx.releases[0].status = ReleaseStatus::Deployed;
        ctx.releases[0].namespace = "elsewhere".into();
        gate::check(&ctx, "opencomply", "opencomply").unwrap();
    }
}
