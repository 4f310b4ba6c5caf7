//! Check records, category results and the validation report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exit::ExitSignal;

/// The result of a single check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "✅ PASS"),
            Self::Fail => write!(f, "❌ FAIL"),
            Self::Warn => write!(f, "⚠️  WARN"),
            Self::Skip => write!(f, "⏭️  SKIP"),
        }
    }
}

/// How much a failing check matters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks success.
    Critical,
    /// Degrades health but does not block.
    Important,
    /// Informational only.
    Advisory,
}

/// Validation categories, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Prerequisites,
    Cluster,
    Service,
    Database,
    Security,
    Network,
    Resource,
    /// Backup verification checks.
    Backup,
}

impl Category {
    /// Fixed validator order.
    pub const ORDER: [Self; 7] = [
        Self::Prerequisites,
        Self::Cluster,
        Self::Service,
        Self::Database,
        Self::Security,
        Self::Network,
        Self::Resource,
    ];

    /// Categories that talk to live endpoints and are left out in fast mode.
    #[must_use]
    pub fn is_expensive(self) -> bool {
        matches!(self, Self::Database | Self::Network)
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Prerequisites => "Prerequisites",
            Self::Cluster => "Cluster",
            Self::Service => "Services",
            Self::Database => "Databases",
            Self::Security => "Security",
            Self::Network => "Network",
            Self::Resource => "Resources",
            Self::Backup => "Backup",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A single check result. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckRecord {
    pub name: String,
    pub category: Category,
    pub status: CheckStatus,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckRecord {
    fn new(
        category: Category,
        name: impl Into<String>,
        status: CheckStatus,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            status,
            severity,
            message: message.into(),
            details: None,
        }
    }

    pub fn pass(
        category: Category,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(category, name, CheckStatus::Pass, severity, message)
    }

    /// A failed check. Advisory failures are recorded as warnings.
    pub fn fail(
        category: Category,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        let status = if severity == Severity::Advisory {
            CheckStatus::Warn
        } else {
            CheckStatus::Fail
        };
        Self::new(category, name, status, severity, message)
    }

    pub fn warn(
        category: Category,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(category, name, CheckStatus::Warn, severity, message)
    }

    pub fn skip(
        category: Category,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self::new(category, name, CheckStatus::Skip, severity, message)
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn is_critical_failure(&self) -> bool {
        self.status == CheckStatus::Fail && self.severity == Severity::Critical
    }
}

/// Tallies over a list of check records.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
}

impl CheckCounts {
    fn tally<'a>(records: impl IntoIterator<Item = &'a CheckRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut counts, record| {
            counts.total += 1;
            match record.status {
                CheckStatus::Pass => counts.passed += 1,
                CheckStatus::Fail => counts.failed += 1,
                CheckStatus::Warn => counts.warnings += 1,
                CheckStatus::Skip => counts.skipped += 1,
            }
            counts
        })
    }

    fn add(self, other: Self) -> Self {
        Self {
            total: self.total + other.total,
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            warnings: self.warnings + other.warnings,
            skipped: self.skipped + other.skipped,
        }
    }
}

#[derive(Deserialize)]
struct RawCategoryResult {
    category: Category,
    checks: Vec<CheckRecord>,
}

impl From<RawCategoryResult> for CategoryResult {
    fn from(raw: RawCategoryResult) -> Self {
        Self::new(raw.category, raw.checks)
    }
}

/// All check records of one category.
///
/// `healthy` and the counts are derived from `checks` on construction,
/// including when deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawCategoryResult")]
pub struct CategoryResult {
    pub category: Category,
    pub checks: Vec<CheckRecord>,
    pub healthy: bool,
    #[serde(flatten)]
    pub counts: CheckCounts,
}

impl CategoryResult {
    #[must_use]
    pub fn new(category: Category, checks: Vec<CheckRecord>) -> Self {
        let healthy = checks.iter().all(|c| c.status != CheckStatus::Fail);
        let counts = CheckCounts::tally(&checks);
        Self {
            category,
            checks,
            healthy,
            counts,
        }
    }

    #[must_use]
    pub fn has_critical_failure(&self) -> bool {
        self.checks.iter().any(CheckRecord::is_critical_failure)
    }
}

/// Why a validation run stopped early.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// A critical check failed in this category.
    CriticalFailure { category: Category },
    /// The caller cancelled the run.
    Cancelled,
}

#[derive(Deserialize)]
struct RawValidationReport {
    timestamp: DateTime<Utc>,
    environment: String,
    fast_mode: bool,
    categories: Vec<CategoryResult>,
    #[serde(default)]
    not_run: Vec<Category>,
    #[serde(default)]
    aborted: Option<AbortReason>,
}

impl From<RawValidationReport> for ValidationReport {
    fn from(raw: RawValidationReport) -> Self {
        let mut report = Self::new(
            raw.environment,
            raw.fast_mode,
            raw.categories,
            raw.not_run,
            raw.aborted,
        );
        report.timestamp = raw.timestamp;
        report
    }
}

/// Point-in-time result of a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawValidationReport")]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub fast_mode: bool,
    pub categories: Vec<CategoryResult>,
    /// Categories never executed because the run stopped early.
    pub not_run: Vec<Category>,
    pub aborted: Option<AbortReason>,
    pub healthy: bool,
    #[serde(flatten)]
    pub counts: CheckCounts,
}

impl ValidationReport {
    #[must_use]
    pub fn new(
        environment: impl Into<String>,
        fast_mode: bool,
        categories: Vec<CategoryResult>,
        not_run: Vec<Category>,
        aborted: Option<AbortReason>,
    ) -> Self {
        // Early stops are carried by `aborted` and `not_run`, not by `healthy`.
        let healthy = categories.iter().all(|c| c.healthy);
        let counts = categories
            .iter()
            .fold(CheckCounts::default(), |acc, c| acc.add(c.counts));
        Self {
            timestamp: Utc::now(),
            environment: environment.into(),
            fast_mode,
            categories,
            not_run,
            aborted,
            healthy,
            counts,
        }
    }

    /// Look up the result of a category.
    #[must_use]
    pub fn category(&self, category: Category) -> Option<&CategoryResult> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// Iterate over every check record in order.
    pub fn checks(&self) -> impl Iterator<Item = &CheckRecord> {
        self.categories.iter().flat_map(|c| c.checks.iter())
    }

    /// Exit signal for automation callers.
    #[must_use]
    pub fn exit_signal(&self) -> ExitSignal {
        if self.aborted == Some(AbortReason::Cancelled) {
            return ExitSignal::Aborted;
        }
        if self.checks().any(CheckRecord::is_critical_failure) {
            ExitSignal::CriticalFailure
        } else if self.counts.failed > 0 {
            ExitSignal::ImportantFailure
        } else {
            ExitSignal::Success
        }
    }

    /// Print a summary of the validation report.
    pub fn print_summary(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════════╗");
        println!("║                  PLATFORM VALIDATION REPORT                      ║");
        println!("╠══════════════════════════════════════════════════════════════════╣");
        println!("║ Environment: {:<52}║", truncate(&self.environment, 52));
        println!("║ Time:        {:<52}║", self.timestamp.to_rfc3339());
        println!(
            "║ Mode:        {:<52}║",
            if self.fast_mode { "fast" } else { "full" }
        );

        for category in &self.categories {
            println!("╠══════════════════════════════════════════════════════════════════╣");
            let marker = if category.healthy { "✅" } else { "❌" };
            println!(
                "║ {marker} {:<20} {:>3}/{:<3} passed{:<32}║",
                category.category.description(),
                category.counts.passed,
                category.counts.total,
                ""
            );
            for check in &category.checks {
                let icon = match check.status {
                    CheckStatus::Pass => "✅",
                    CheckStatus::Fail => "❌",
                    CheckStatus::Warn => "⚠️ ",
                    CheckStatus::Skip => "⏭️ ",
                };
                println!(
                    "║   {icon} {:<28} {:<33}║",
                    truncate(&check.name, 28),
                    truncate(&check.message, 33)
                );
            }
        }

        if !self.not_run.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════════╣");
            let names: Vec<_> = self.not_run.iter().map(|c| c.description()).collect();
            println!("║ Not run: {:<56}║", truncate(&names.join(", "), 56));
        }

        println!("╠══════════════════════════════════════════════════════════════════╣");
        println!(
            "║ SUMMARY: {} passed, {} failed, {} warnings, {} skipped{:<20}║",
            self.counts.passed, self.counts.failed, self.counts.warnings, self.counts.skipped, ""
        );
        match (&self.aborted, self.healthy) {
            (Some(AbortReason::Cancelled), _) => {
                println!("║ ⏹️  VALIDATION CANCELLED                                          ║");
            }
            (Some(AbortReason::CriticalFailure { category }), _) => {
                println!(
                    "║ ❌ STOPPED AFTER CRITICAL FAILURE IN {:<28}║",
                    category.description().to_uppercase()
                );
            }
            (None, true) => {
                println!("║ ✅ PLATFORM HEALTHY                                              ║");
            }
            (None, false) => {
                println!("║ ⚠️  PLATFORM VALIDATION FOUND ISSUES                             ║");
            }
        }
        println!("╚══════════════════════════════════════════════════════════════════╝");
        println!();
    }
}

/// Truncate a string to a maximum number of characters.
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
