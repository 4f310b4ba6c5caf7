//! Can we reach the cluster and the target namespace at all.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::ResourceKind;
use crate::error::Result;
use crate::validation::context::{Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Prerequisites;

pub struct PrerequisitesValidator;

#[async_trait]
impl Validator for PrerequisitesValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(CATEGORY, "cluster_api_reachable", Severity::Critical, api_reachable(ctx))
                .boxed(),
            ctx.check(CATEGORY, "namespace_exists", Severity::Critical, namespace_exists(ctx))
                .boxed(),
            ctx.check(CATEGORY, "workload_access", Severity::Critical, workload_access(ctx))
                .boxed(),
        ])
        .await
    }
}

async fn api_reachable(ctx: &ValidationContext) -> Result<Finding> {
    let namespaces = ctx
        .cluster
        .list_resources(ResourceKind::Namespace, None)
        .await?;
    Ok(Finding::Pass(format!(
        "API server reachable ({} namespaces)",
        namespaces.len()
    )))
}

async fn namespace_exists(ctx: &ValidationContext) -> Result<Finding> {
    let namespace = ctx
        .cluster
        .get_resource_status(ResourceKind::Namespace, None, &ctx.namespace)
        .await?;
    Ok(match namespace {
        Some(ns) if ns.phase.as_deref() == Some("Terminating") => {
            Finding::Fail(format!("namespace {} is terminating", ctx.namespace))
        }
        Some(_) => Finding::Pass(format!("namespace {} exists", ctx.namespace)),
        None => Finding::Fail(format!("namespace {} not found", ctx.namespace)),
    })
}

async fn workload_access(ctx: &ValidationContext) -> Result<Finding> {
    let pods = ctx.list(ResourceKind::Pod).await?;
    Ok(Finding::Pass(format!(
        "can list pods in {} ({} found)",
        ctx.namespace,
        pods.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{healthy_cluster, FakeCluster};
    use crate::validation::report::CheckStatus;

    #[tokio::test]
    async fn test_prerequisites_pass_on_healthy_cluster() {
        let ctx = healthy_cluster().context();
        let records = PrerequisitesValidator.run(&ctx).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == CheckStatus::Pass));
        assert_eq!(records[0].name, "cluster_api_reachable");
    }

    #[tokio::test]
    async fn test_missing_namespace_is_critical() {
        let cluster = FakeCluster::new();
        let ctx = cluster.context();
        let records = PrerequisitesValidator.run(&ctx).await;
        let ns = records.iter().find(|r| r.name == "namespace_exists").unwrap();
        assert!(ns.is_critical_failure());
    }

    #[tokio::test]
    async fn test_unreachable_api_becomes_failure_record() {
        let cluster = healthy_cluster();
        cluster.set_unreachable(true);
        let ctx = cluster.context();
        let records = PrerequisitesValidator.run(&ctx).await;
        assert!(records.iter().all(CheckRecord::is_critical_failure));
        assert!(records[0]
            .details
            .as_deref()
            .unwrap()
            .contains("transient remote error"));
    }
}
