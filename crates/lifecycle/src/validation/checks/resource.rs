//! Storage claims, scheduling and resource pressure.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::ResourceKind;
use crate::error::Result;
use crate::validation::context::{name_list, Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Resource;

const PRESSURE_CONDITIONS: [&str; 3] = ["MemoryPressure", "DiskPressure", "PIDPressure"];

pub struct ResourceValidator;

#[async_trait]
impl Validator for ResourceValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(CATEGORY, "pvcs_bound", Severity::Important, pvcs_bound(ctx))
                .boxed(),
            ctx.check(CATEGORY, "no_pending_pods", Severity::Important, no_pending_pods(ctx))
                .boxed(),
            ctx.check(CATEGORY, "restart_counts", Severity::Advisory, restart_counts(ctx))
                .boxed(),
            ctx.check(
                CATEGORY,
                "node_resource_pressure",
                Severity::Advisory,
                node_resource_pressure(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

async fn pvcs_bound(ctx: &ValidationContext) -> Result<Finding> {
    let claims = ctx.list(ResourceKind::PersistentVolumeClaim).await?;
    let unbound: Vec<_> = claims
        .iter()
        .filter(|c| !c.ready)
        .map(|c| c.name.as_str())
        .collect();
    Ok(if unbound.is_empty() {
        Finding::Pass(format!("{} PVCs bound", claims.len()))
    } else {
        Finding::FailWith(
            format!("{}/{} PVCs not bound", unbound.len(), claims.len()),
            name_list(unbound),
        )
    })
}

async fn no_pending_pods(ctx: &ValidationContext) -> Result<Finding> {
    let pods = ctx.list(ResourceKind::Pod).await?;
    let pending: Vec<_> = pods
        .iter()
        .filter(|p| p.phase.as_deref() == Some("Pending"))
        .map(|p| p.name.as_str())
        .collect();
    Ok(if pending.is_empty() {
        Finding::Pass("no pending pods".into())
    } else {
        Finding::FailWith(format!("{} pods pending", pending.len()), name_list(pending))
    })
}

async fn restart_counts(ctx: &ValidationContext) -> Result<Finding> {
    let threshold = ctx.settings.restart_threshold;
    let pods = ctx.list(ResourceKind::Pod).await?;
    let restarting: Vec<_> = pods
        .iter()
        .filter(|p| p.restart_count > threshold)
        .map(|p| format!("{} ({})", p.name, p.restart_count))
        .collect();
    Ok(if restarting.is_empty() {
        Finding::Pass(format!("no pod above {threshold} restarts"))
    } else {
        Finding::FailWith(
            format!("{} pods above {threshold} restarts", restarting.len()),
            restarting.join(", "),
        )
    })
}

async fn node_resource_pressure(ctx: &ValidationContext) -> Result<Finding> {
    let nodes = ctx.cluster.list_resources(ResourceKind::Node, None).await?;
    let pressured: Vec<_> = nodes
        .iter()
        .flat_map(|n| {
            PRESSURE_CONDITIONS
                .iter()
                .filter(move |c| n.condition_true(c))
                .map(move |c| format!("{}: {c}", n.name))
        })
        .collect();
    Ok(if pressured.is_empty() {
        Finding::Pass("no node under resource pressure".into())
    } else {
        Finding::FailWith(
            format!("{} pressure conditions", pressured.len()),
            pressured.join(", "),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{healthy_cluster, node, pod};
    use crate::validation::report::CheckStatus;

    #[tokio::test]
    async fn test_healthy_resources() {
        let ctx = healthy_cluster().context();
        let records = ResourceValidator.run(&ctx).await;
        assert!(records.iter().all(|r| r.status == CheckStatus::Pass));
    }

    #[tokio::test]
    async fn test_pending_pods_and_pressure() {
        let cluster = healthy_cluster();
        cluster.add(ResourceKind::Pod, pod("platform", "api-7", "Pending"));
        let mut flapping = pod("platform", "worker-1", "Running");
        flapping.restart_count = 12;
        cluster.add(ResourceKind::Pod, flapping);
        let mut pressured = node("worker-9", true);
        pressured
            .conditions
            .insert("DiskPressure".into(), "True".into());
        cluster.add(ResourceKind::Node, pressured);

        let ctx = cluster.context();
        let records = ResourceValidator.run(&ctx).await;
        assert_eq!(records[1].status, CheckStatus::Fail);
        assert_eq!(records[1].details.as_deref(), Some("api-7"));
        assert_eq!(records[2].status, CheckStatus::Warn);
        assert_eq!(records[2].details.as_deref(), Some("worker-1 (12)"));
        assert_eq!(records[3].status, CheckStatus::Warn);
        assert_eq!(records[3].details.as_deref(), Some("worker-9: DiskPressure"));
    }
}
