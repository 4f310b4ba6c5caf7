//! Secrets, pod privileges and network isolation.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::ResourceKind;
use crate::error::Result;
use crate::validation::context::{name_list, Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Security;

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

pub struct SecurityValidator;

#[async_trait]
impl Validator for SecurityValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(
                CATEGORY,
                "required_secrets_present",
                Severity::Important,
                required_secrets_present(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "no_privileged_pods",
                Severity::Important,
                no_privileged_pods(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "network_policies_present",
                Severity::Advisory,
                network_policies_present(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "tls_secret_present",
                Severity::Advisory,
                tls_secret_present(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

async fn required_secrets_present(ctx: &ValidationContext) -> Result<Finding> {
    let required = &ctx.settings.required_secrets;
    if required.is_empty() {
        return Ok(Finding::Skip("no required secrets configured".into()));
    }
    let mut missing = Vec::new();
    for name in required {
        let secret = ctx
            .cluster
            .get_resource_status(ResourceKind::Secret, Some(&ctx.namespace), name)
            .await?;
        if secret.is_none() {
            missing.push(name.as_str());
        }
    }
    Ok(if missing.is_empty() {
        Finding::Pass(format!("{} required secrets present", required.len()))
    } else {
        Finding::FailWith(
            format!("{} required secrets missing", missing.len()),
            name_list(missing),
        )
    })
}

async fn no_privileged_pods(ctx: &ValidationContext) -> Result<Finding> {
    let pods = ctx.list(ResourceKind::Pod).await?;
    let privileged: Vec<_> = pods
        .iter()
        .filter(|p| p.attribute("privileged") == Some("true"))
        .map(|p| p.name.as_str())
        .collect();
    Ok(if privileged.is_empty() {
        Finding::Pass("no privileged containers".into())
    } else {
        Finding::FailWith(
            format!("{} pods run privileged containers", privileged.len()),
            name_list(privileged),
        )
    })
}

async fn network_policies_present(ctx: &ValidationContext) -> Result<Finding> {
    let policies = ctx.list(ResourceKind::NetworkPolicy).await?;
    Ok(if policies.is_empty() {
        Finding::Fail(format!("no network policies in {}", ctx.namespace))
    } else {
        Finding::Pass(format!("{} network policies", policies.len()))
    })
}

async fn tls_secret_present(ctx: &ValidationContext) -> Result<Finding> {
    let Some(name) = &ctx.settings.tls_secret else {
        return Ok(Finding::Skip("no TLS secret configured".into()));
    };
    let secret = ctx
        .cluster
        .get_resource_status(ResourceKind::Secret, Some(&ctx.namespace), name)
        .await?;
    Ok(match secret {
        None => Finding::Fail(format!("TLS secret {name} not found")),
        Some(s) if s.attribute("type") != Some(TLS_SECRET_TYPE) => Finding::Fail(format!(
            "secret {name} has type {}, expected {TLS_SECRET_TYPE}",
            s.attribute("type").unwrap_or("unknown")
        )),
        Some(_) => Finding::Pass(format!("TLS secret {name} present")),
    })
}
