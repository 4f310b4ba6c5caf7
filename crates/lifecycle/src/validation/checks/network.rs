//! In-cluster connectivity, probed from a running workload.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;

use super::Validator;
use crate::clients::ResourceKind;
use crate::error::{LifecycleError, Result};
use crate::validation::context::{Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Network;

const DNS_PROBE_NAME: &str = "kubernetes.default.svc.cluster.local";

pub struct NetworkValidator;

#[async_trait]
impl Validator for NetworkValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(CATEGORY, "dns_resolution", Severity::Important, dns_resolution(ctx))
                .boxed(),
            ctx.check(
                CATEGORY,
                "database_port_reachable",
                Severity::Important,
                port_reachable(ctx, &ctx.settings.database_endpoint),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "cache_port_reachable",
                Severity::Important,
                port_reachable(ctx, &ctx.settings.cache_endpoint),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "ingress_configured",
                Severity::Advisory,
                ingress_configured(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

async fn dns_resolution(ctx: &ValidationContext) -> Result<Finding> {
    let output = ctx
        .exec(&ctx.settings.probe, &["nslookup", DNS_PROBE_NAME])
        .await?;
    Ok(if output.success() {
        Finding::Pass(format!("{DNS_PROBE_NAME} resolves"))
    } else {
        Finding::FailWith(
            format!("cannot resolve {DNS_PROBE_NAME}"),
            output.stderr.trim().to_string(),
        )
    })
}

/// Split `host:port`.
fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    endpoint
        .rsplit_once(':')
        .filter(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .ok_or_else(|| {
            LifecycleError::Configuration(format!("endpoint {endpoint:?} is not host:port"))
        })
}

async fn port_reachable(ctx: &ValidationContext, endpoint: &str) -> Result<Finding> {
    let (host, port) = split_endpoint(endpoint)?;
    let output = ctx
        .exec(&ctx.settings.probe, &["nc", "-z", "-w", "3", host, port])
        .await?;
    Ok(if output.success() {
        Finding::Pass(format!("{endpoint} reachable"))
    } else {
        Finding::FailWith(
            format!("{endpoint} unreachable"),
            output.stderr.trim().to_string(),
        )
    })
}

async fn ingress_configured(ctx: &ValidationContext) -> Result<Finding> {
    let ingresses = ctx.list(ResourceKind::Ingress).await?;
    if ingresses.is_empty() {
        return Ok(Finding::Fail(format!("no ingress in {}", ctx.namespace)));
    }
    let without_tls = ingresses
        .iter()
        .filter(|i| i.attribute("tls") != Some("true"))
        .count();
    Ok(if without_tls == 0 {
        Finding::Pass(format!("{} ingresses with TLS", ingresses.len()))
    } else {
        Finding::Fail(format!("{without_tls} ingresses without TLS"))
    })
}
