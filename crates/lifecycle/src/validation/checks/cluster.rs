//! Node and control-plane health.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::ResourceKind;
use crate::error::Result;
use crate::validation::context::{name_list, Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Cluster;

pub struct ClusterValidator;

#[async_trait]
impl Validator for ClusterValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(CATEGORY, "nodes_ready", Severity::Critical, nodes_ready(ctx))
                .boxed(),
            ctx.check(CATEGORY, "node_count", Severity::Important, node_count(ctx))
                .boxed(),
            ctx.check(
                CATEGORY,
                "system_pods_running",
                Severity::Important,
                system_pods_running(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "node_network_available",
                Severity::Advisory,
                node_network_available(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

async fn nodes_ready(ctx: &ValidationContext) -> Result<Finding> {
    let nodes = ctx.cluster.list_resources(ResourceKind::Node, None).await?;
    if nodes.is_empty() {
        return Ok(Finding::Fail("no nodes registered".into()));
    }
    let not_ready: Vec<_> = nodes
        .iter()
        .filter(|n| !n.ready)
        .map(|n| n.name.as_str())
        .collect();
    let ready = nodes.len() - not_ready.len();
    Ok(if not_ready.is_empty() {
        Finding::Pass(format!("{ready}/{} nodes Ready", nodes.len()))
    } else {
        Finding::FailWith(
            format!("{ready}/{} nodes Ready", nodes.len()),
            format!("not ready: {}", name_list(not_ready)),
        )
    })
}

async fn node_count(ctx: &ValidationContext) -> Result<Finding> {
    let nodes = ctx.cluster.list_resources(ResourceKind::Node, None).await?;
    let min = ctx.settings.min_nodes;
    Ok(if nodes.len() >= min {
        Finding::Pass(format!("{} nodes (minimum {min})", nodes.len()))
    } else {
        Finding::Fail(format!("{} nodes, expected at least {min}", nodes.len()))
    })
}

async fn system_pods_running(ctx: &ValidationContext) -> Result<Finding> {
    let pods = ctx
        .cluster
        .list_resources(ResourceKind::Pod, Some(&ctx.settings.system_namespace))
        .await?;
    if pods.is_empty() {
        return Ok(Finding::Fail(format!(
            "no pods in {}",
            ctx.settings.system_namespace
        )));
    }
    let unhealthy: Vec<_> = pods
        .iter()
        .filter(|p| !matches!(p.phase.as_deref(), Some("Running" | "Succeeded")))
        .map(|p| p.name.as_str())
        .collect();
    let running = pods.len() - unhealthy.len();
    Ok(if unhealthy.is_empty() {
        Finding::Pass(format!("{running}/{} system pods running", pods.len()))
    } else {
        Finding::FailWith(
            format!("{running}/{} system pods running", pods.len()),
            format!("not running: {}", name_list(unhealthy)),
        )
    })
}

async fn node_network_available(ctx: &ValidationContext) -> Result<Finding> {
    let nodes = ctx.cluster.list_resources(ResourceKind::Node, None).await?;
    let affected: Vec<_> = nodes
        .iter()
        .filter(|n| n.condition_true("NetworkUnavailable"))
        .map(|n| n.name.as_str())
        .collect();
    Ok(if affected.is_empty() {
        Finding::Pass("node networking available".into())
    } else {
        Finding::FailWith(
            format!("{} nodes report NetworkUnavailable", affected.len()),
            name_list(affected),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{healthy_cluster, node};
    use crate::validation::report::CheckStatus;

    #[tokio::test]
    async fn test_healthy_cluster_passes() {
        let ctx = healthy_cluster().context();
        let records = ClusterValidator.run(&ctx).await;
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "nodes_ready",
                "node_count",
                "system_pods_running",
                "node_network_available"
            ]
        );
        assert!(records.iter().all(|r| r.status == CheckStatus::Pass));
        assert_eq!(records[0].message, "3/3 nodes Ready");
        assert_eq!(records[2].message, "15/15 system pods running");
    }

    #[tokio::test]
    async fn test_not_ready_node_is_critical() {
        let cluster = healthy_cluster();
        cluster.add(ResourceKind::Node, node("worker-4", false));
        let ctx = cluster.context();
        let records = ClusterValidator.run(&ctx).await;
        assert!(records[0].is_critical_failure());
        assert_eq!(records[0].details.as_deref(), Some("not ready: worker-4"));
    }

    #[tokio::test]
    async fn test_too_few_nodes_is_important() {
        let cluster = healthy_cluster();
        let mut ctx = cluster.context();
        ctx.settings.min_nodes = 5;
        let records = ClusterValidator.run(&ctx).await;
        assert_eq!(records[1].status, CheckStatus::Fail);
        assert_eq!(records[1].severity, Severity::Important);
        assert!(!records[1].is_critical_failure());
    }
}
