//! Data services: relational/time-series store, cache cluster, event broker.
//!
//! These checks execute client tooling inside the service pods, so they talk
//! to the real endpoints rather than to the cluster API.

use std::sync::LazyLock;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use regex::Regex;

use super::Validator;
use crate::clients::ExecOutput;
use crate::error::Result;
use crate::validation::context::{Finding, ValidationContext};
use crate::validation::report::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Database;

/// Broker lines printed by `kafka-broker-api-versions.sh`, e.g. `kafka-0:9092 (id: 0 rack: null)`.
static BROKER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(id:\s*(\d+)").expect("broker id pattern"));

pub struct DatabaseValidator;

#[async_trait]
impl Validator for DatabaseValidator {
    fn category(&self) -> Category {
        CATEGORY
    }

    async fn run(&self, ctx: &ValidationContext) -> Vec<CheckRecord> {
        join_all(vec![
            ctx.check(
                CATEGORY,
                "postgres_accepting_connections",
                Severity::Critical,
                postgres_accepting_connections(ctx),
            )
            .boxed(),
            ctx.check(CATEGORY, "postgres_query", Severity::Important, postgres_query(ctx))
                .boxed(),
            ctx.check(
                CATEGORY,
                "timescaledb_extension",
                Severity::Important,
                timescaledb_extension(ctx),
            )
            .boxed(),
            ctx.check(CATEGORY, "redis_ping", Severity::Important, redis_ping(ctx))
                .boxed(),
            ctx.check(
                CATEGORY,
                "redis_cluster_state",
                Severity::Important,
                redis_cluster_state(ctx),
            )
            .boxed(),
            ctx.check(
                CATEGORY,
                "kafka_brokers_reachable",
                Severity::Important,
                kafka_brokers_reachable(ctx),
            )
            .boxed(),
        ])
        .await
    }
}

fn failure_output(output: &ExecOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout_text()
    } else {
        stderr.to_string()
    }
}

async fn psql(ctx: &ValidationContext, sql: &str) -> Result<ExecOutput> {
    let user = ctx.settings.database_user.as_str();
    ctx.exec(&ctx.settings.postgres, &["psql", "-U", user, "-tAc", sql])
        .await
}

async fn postgres_accepting_connections(ctx: &ValidationContext) -> Result<Finding> {
    let user = ctx.settings.database_user.as_str();
    let output = ctx
        .exec(&ctx.settings.postgres, &["pg_isready", "-U", user])
        .await?;
    Ok(if output.success() {
        Finding::Pass("accepting connections".into())
    } else {
        Finding::FailWith(
            format!("pg_isready exited with {}", output.exit_code),
            failure_output(&output),
        )
    })
}

async fn postgres_query(ctx: &ValidationContext) -> Result<Finding> {
    let output = psql(ctx, "SELECT 1").await?;
    Ok(if output.success() && output.stdout_text() == "1" {
        Finding::Pass("query executed".into())
    } else {
        Finding::FailWith("SELECT 1 failed".into(), failure_output(&output))
    })
}

async fn timescaledb_extension(ctx: &ValidationContext) -> Result<Finding> {
    let output = psql(
        ctx,
        "SELECT extversion FROM pg_extension WHERE extname = 'timescaledb'",
    )
    .await?;
    if !output.success() {
        return Ok(Finding::FailWith(
            "extension query failed".into(),
            failure_output(&output),
        ));
    }
    let version = output.stdout_text();
    Ok(if version.is_empty() {
        Finding::Fail("timescaledb extension not installed".into())
    } else {
        Finding::Pass(format!("timescaledb {version}"))
    })
}

async fn redis_ping(ctx: &ValidationContext) -> Result<Finding> {
    let output = ctx.exec(&ctx.settings.redis, &["redis-cli", "ping"]).await?;
    Ok(if output.success() && output.stdout_text() == "PONG" {
        Finding::Pass("PONG".into())
    } else {
        Finding::FailWith("no PONG from redis".into(), failure_output(&output))
    })
}

async fn redis_cluster_state(ctx: &ValidationContext) -> Result<Finding> {
    let output = ctx
        .exec(&ctx.settings.redis, &["redis-cli", "cluster", "info"])
        .await?;
    let text = output.stdout_text();
    if text.contains("cluster support disabled") {
        return Ok(Finding::Skip("redis runs in standalone mode".into()));
    }
    let state = text
        .lines()
        .find_map(|line| line.trim().strip_prefix("cluster_state:"))
        .map(str::to_string);
    Ok(match state.as_deref() {
        Some("ok") => Finding::Pass("cluster_state:ok".into()),
        Some(other) => Finding::Fail(format!("cluster_state:{other}")),
        None => Finding::FailWith("cluster state unavailable".into(), failure_output(&output)),
    })
}

async fn kafka_brokers_reachable(ctx: &ValidationContext) -> Result<Finding> {
    let output = ctx
        .exec(
            &ctx.settings.kafka,
            &[
                "kafka-broker-api-versions.sh",
                "--bootstrap-server",
                ctx.settings.kafka_bootstrap.as_str(),
            ],
        )
        .await?;
    if !output.success() {
        return Ok(Finding::FailWith(
            "bootstrap server unreachable".into(),
            failure_output(&output),
        ));
    }
    let brokers = BROKER_ID
        .captures_iter(&output.stdout_text())
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    Ok(if brokers == 0 {
        Finding::Fail("no brokers listed".into())
    } else {
        Finding::Pass(format!("{brokers} brokers reachable"))
    })
}
