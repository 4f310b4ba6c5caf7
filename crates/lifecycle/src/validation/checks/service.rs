//! Application workloads and their services.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::{ResourceKind, ResourceStatus};
use crate::error::Result;
use crate::validation::context::{name_list, Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Service;

pub struct ServiceValidator;

#[async_trait]
impl Validator for ServiceValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(
                CATEGORY,
                "deployments_available",
                Severity::Important,
                replicas_ready(ctx, ResourceKind::Deployment),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "statefulsets_ready",
                Severity::Important,
                replicas_ready(ctx, ResourceKind::StatefulSet),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "expected_workloads_present",
                Severity::Important,
                expected_workloads_present(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "service_endpoints",
                Severity::Advisory,
                service_endpoints(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

fn replica_summary(workload: &ResourceStatus) -> String {
    format!(
        "{} ({}/{})",
        workload.name,
        workload.ready_replicas.unwrap_or(0),
        workload.desired_replicas.unwrap_or(0)
    )
}

async fn replicas_ready(ctx: &ValidationContext, kind: ResourceKind) -> Result<Finding> {
    let workloads = ctx.list(kind).await?;
    if workloads.is_empty() {
        return Ok(Finding::Pass(format!("no {kind}s in {}", ctx.namespace)));
    }
    let degraded: Vec<_> = workloads
        .iter()
        .filter(|w| !w.ready)
        .map(replica_summary)
        .collect();
    let ready = workloads.len() - degraded.len();
    Ok(if degraded.is_empty() {
        Finding::Pass(format!("{ready}/{} {kind}s ready", workloads.len()))
    } else {
        Finding::FailWith(
            format!("{ready}/{} {kind}s ready", workloads.len()),
            degraded.join(", "),
        )
    })
}

async fn expected_workloads_present(ctx: &ValidationContext) -> Result<Finding> {
    let expected = &ctx.settings.expected_workloads;
    if expected.is_empty() {
        return Ok(Finding::Skip("no expected workloads configured".into()));
    }
    let mut present = BTreeSet::new();
    for kind in [ResourceKind::Deployment, ResourceKind::StatefulSet] {
        present.extend(ctx.list(kind).await?.into_iter().map(|w| w.name));
    }
    let missing: Vec<_> = expected
        .iter()
        .filter(|name| !present.contains(name.as_str()))
        .map(String::as_str)
        .collect();
    Ok(if missing.is_empty() {
        Finding::Pass(format!("all {} expected workloads present", expected.len()))
    } else {
        Finding::FailWith(
            format!("{} expected workloads missing", missing.len()),
            name_list(missing),
        )
    })
}

async fn service_endpoints(ctx: &ValidationContext) -> Result<Finding> {
    let services = ctx.list(ResourceKind::Service).await?;
    let endpoints = ctx.list(ResourceKind::Endpoints).await?;
    let without: Vec<_> = services
        .iter()
        .filter(|s| s.attribute("type") != Some("ExternalName"))
        .filter(|s| !endpoints.iter().any(|e| e.name == s.name && e.ready))
        .map(|s| s.name.as_str())
        .collect();
    Ok(if without.is_empty() {
        Finding::Pass(format!("{} services have endpoints", services.len()))
    } else {
        Finding::FailWith(
            format!("{} services without ready endpoints", without.len()),
            name_list(without),
        )
    })
}
