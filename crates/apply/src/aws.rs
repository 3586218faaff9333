//! AWS helpers: ACM certificate discovery and the organization bootstrap
//! CloudFormation stack (org-wide read-only role, read-only user, and a
//! StackSet deploying a member-account role under managed read-only
//! policies with an explicit deny on sensitive read actions).

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::info;

use comply_cluster::cmd;
use comply_core::CertificateRef;

/// Reads that return payloads rather than configuration: console
/// screenshots, table contents, object bodies, and the like.
pub const DENIED_READ_ACTIONS: &[&str] = &[
    "ec2:GetConsoleScreenshot",
    "ec2:GetConsoleOutput",
    "dynamodb:GetItem",
    "dynamodb:BatchGetItem",
    "dynamodb:Query",
    "dynamodb:Scan",
    "s3:GetObject",
    "lambda:GetFunction",
    "cloudformation:GetTemplate",
    "ecr:BatchGetImage",
    "kinesis:Get*",
    "sqs:ReceiveMessage",
    "athena:GetQueryResults",
    "sdb:Select*",
];

const MANAGED_READONLY_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/ReadOnlyAccess",
    "arn:aws:iam::aws:policy/SecurityAudit",
];

#[derive(Debug, Deserialize)]
struct CertificateList {
    #[serde(rename = "CertificateSummaryList")]
    certificates: Vec<CertificateSummary>,
}

#[derive(Debug, Deserialize)]
struct CertificateSummary {
    #[serde(rename = "CertificateArn")]
    arn: String,
    #[serde(rename = "DomainName")]
    domain: String,
}

/// Exact-domain match among ISSUED certificates only.
pub fn match_certificate(list_json: &str, domain: &str) -> Result<Option<CertificateRef>> {
    let list: CertificateList =
        serde_json::from_str(list_json).context("parsing acm list-certificates output")?;
    Ok(list
        .certificates
        .into_iter()
        .find(|c| c.domain == domain)
        .map(|c| CertificateRef { arn: c.arn, domain: c.domain }))
}

pub async fn find_issued_certificate(domain: &str) -> Result<Option<CertificateRef>> {
    let out = cmd::run(
        "aws",
        &["acm", "list-certificates", "--certificate-statuses", "ISSUED", "--output", "json"],
    )
    .await?;
    let found = match_certificate(&out, domain)?;
    if let Some(cert) = &found {
        info!(domain, arn = %cert.arn, "issued certificate found");
    }
    Ok(found)
}

#[derive(Debug, Clone)]
pub struct BootstrapParams {
    pub iam_username: String,
    pub role_name: String,
    pub organization_units: Vec<String>,
}

fn deny_statement() -> Json {
    serde_json::json!({
        "Effect": "Deny",
        "Action": DENIED_READ_ACTIONS,
        "Resource": "*"
    })
}

/// Template deployed into every member account by the StackSet.
fn member_account_template() -> Json {
    serde_json::json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Description": "Per-member-account read-only role for OpenComply",
        "Parameters": {
            "RoleNameInAccount": { "Type": "String" },
            "TrustedPrincipalArn": { "Type": "String" }
        },
        "Resources": {
            "MemberReadOnlyRole": {
                "Type": "AWS::IAM::Role",
                "Properties": {
                    "RoleName": { "Ref": "RoleNameInAccount" },
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Principal": { "AWS": { "Ref": "TrustedPrincipalArn" } },
                            "Action": "sts:AssumeRole"
                        }]
                    },
                    "ManagedPolicyArns": MANAGED_READONLY_POLICIES,
                    "Policies": [{
                        "PolicyName": "DenySensitiveReads",
                        "PolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [deny_statement()]
                        }
                    }]
                }
            }
        }
    })
}

/// The management-account bootstrap stack.
pub fn bootstrap_template(params: &BootstrapParams) -> Json {
    let member_body =
        serde_json::to_string(&member_account_template()).expect("member template serializes");
    serde_json::json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Description": "OpenComply organization bootstrap: read-only audit access",
        "Parameters": {
            "IAMUsernameInOrganizationAccount": {
                "Type": "String",
                "Default": params.iam_username
            },
            "RoleNameInAccount": {
                "Type": "String",
                "Default": params.role_name
            },
            "OrganizationUnitList": {
                "Type": "CommaDelimitedList",
                "Default": params.organization_units.join(",")
            }
        },
        "Resources": {
            "ReadOnlyUser": {
                "Type": "AWS::IAM::User",
                "Properties": {
                    "UserName": { "Ref": "IAMUsernameInOrganizationAccount" },
                    "Policies": [{
                        "PolicyName": "AssumeOrganizationReadOnlyRoles",
                        "PolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [{
                                "Effect": "Allow",
                                "Action": "sts:AssumeRole",
                                "Resource": { "Fn::Sub": "arn:aws:iam::*:role/${RoleNameInAccount}" }
                            }]
                        }
                    }]
                }
            },
            "OrganizationReadOnlyRole": {
                "Type": "AWS::IAM::Role",
                "Properties": {
                    "RoleName": { "Ref": "RoleNameInAccount" },
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Principal": { "AWS": { "Fn::GetAtt": ["ReadOnlyUser", "Arn"] } },
                            "Action": "sts:AssumeRole"
                        }]
                    },
                    "ManagedPolicyArns": MANAGED_READONLY_POLICIES,
                    "Policies": [{
                        "PolicyName": "DenySensitiveReads",
                        "PolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [deny_statement()]
                        }
                    }]
                }
            },
            "MemberAccountRoleStackSet": {
                "Type": "AWS::CloudFormation::StackSet",
                "Properties": {
                    "StackSetName": "opencomply-member-readonly",
                    "PermissionModel": "SERVICE_MANAGED",
                    "Capabilities": ["CAPABILITY_NAMED_IAM"],
                    "AutoDeployment": {
                        "Enabled": true,
                        "RetainStacksOnAccountRemoval": false
                    },
                    "Parameters": [
                        {
                            "ParameterKey": "RoleNameInAccount",
                            "ParameterValue": { "Ref": "RoleNameInAccount" }
                        },
                        {
                            "ParameterKey": "TrustedPrincipalArn",
                            "ParameterValue": { "Fn::GetAtt": ["OrganizationReadOnlyRole", "Arn"] }
                        }
                    ],
                    "StackInstancesGroup": [{
                        "Regions": [{ "Ref": "AWS::Region" }],
                        "DeploymentTargets": {
                            "OrganizationalUnitIds": { "Ref": "OrganizationUnitList" }
                        }
                    }],
                    "TemplateBody": member_body
                }
            }
        }
    })
}

/// Render and deploy the bootstrap stack via the AWS CLI.
pub async fn deploy_bootstrap(stack_name: &str, params: &BootstrapParams) -> Result<()> {
    let template = bootstrap_template(params);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = std::env::temp_dir().join(format!("complyctl-bootstrap-{nanos}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(&template)?)
        .with_context(|| format!("writing template {}", path.display()))?;
    let path_s = path.to_string_lossy().to_string();
    let res = cmd::run(
        "aws",
        &[
            "cloudformation",
            "deploy",
            "--stack-name",
            stack_name,
            "--template-file",
            path_s.as_str(),
            "--capabilities",
            "CAPABILITY_NAMED_IAM",
        ],
    )
    .await;
    let _ = std::fs::remove_file(&path);
    res.map(|_| ())?;
    info!(stack = stack_name, "bootstrap stack deployed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LIST: &str = r#"{
        "CertificateSummaryList": [
            { "CertificateArn": "arn:aws:acm:us-east-1:1111:certificate/a",
              "DomainName": "other.example.com" },
            { "CertificateArn": "arn:aws:acm:us-east-1:1111:certificate/b",
              "DomainName": "app.example.com" }
        ]
    }"#;

    #[test]
    fn certificate_lookup_matches_exact_domain_only() {
        let found = match_certificate(SAMPLE_LIST, "app.example.com").unwrap().unwrap();
        assert!(found.arn.ends_with("certificate/b"));
        assert!(match_certificate(SAMPLE_LIST, "sub.app.example.com").unwrap().is_none());
    }

    #[test]
    fn bootstrap_template_shape() {
        let p = BootstrapParams {
            iam_username: "OpenComplyReadOnlyUser".into(),
            role_name: "OpenComplyReadOnly".into(),
            organization_units: vec!["ou-abc1-11111111".into()],
        };
        let t = bootstrap_template(&p);
        let resources = t["Resources"].as_object().unwrap();
        assert!(resources.contains_key("ReadOnlyUser"));
        assert!(resources.contains_key("OrganizationReadOnlyRole"));
        assert!(resources.contains_key("MemberAccountRoleStackSet"));
        assert_eq!(t["Parameters"]["OrganizationUnitList"]["Type"], "CommaDelimitedList");

        // The deny list must be present in the management role...
        let deny = &t["Resources"]["OrganizationReadOnlyRole"]["Properties"]["Policies"][0]
            ["PolicyDocument"]["Statement"][0];
        assert_eq!(deny["Effect"], "Deny");
        let actions: Vec<&str> = deny["Action"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert!(actions.contains(&"ec2:GetConsoleScreenshot"));
        assert!(actions.contains(&"dynamodb:Scan"));
        assert!(actions.contains(&"s3:GetObject"));

        // ...and inside the member-account template carried by the StackSet.
        let body = t["Resources"]["MemberAccountRoleStackSet"]["Properties"]["TemplateBody"]
            .as_str()
            .unwrap();
        let member: Json = serde_json::from_str(body).unwrap();
        let member_deny = &member["Resources"]["MemberReadOnlyRole"]["Properties"]["Policies"][0]
            ["PolicyDocument"]["Statement"][0];
        assert_eq!(member_deny["Effect"], "Deny");
        assert!(member_deny["Action"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "s3:GetObject"));
    }
}
