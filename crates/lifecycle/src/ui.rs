//! UI helpers for the lifecycle CLI.
//!
//! Consistent console formatting for validation, backup and teardown runs.

use colored::Colorize;

use lifecycle::teardown::{StepStatus, TeardownState};
use lifecycle::validation::{CheckRecord, CheckStatus};

/// Print the lifecycle banner.
pub fn print_banner(environment: &str) {
    println!();
    println!(
        "{}",
        r"
  _     _  __                      _
 | |   (_)/ _| ___  ___ _   _  ___| | ___
 | |   | | |_ / _ \/ __| | | |/ __| |/ _ \
 | |___| |  _|  __/ (__| |_| | (__| |  __/
 |_____|_|_|  \___|\___|\__, |\___|_|\___|
                        |___/
"
        .cyan()
    );
    println!(
        "  {} {}",
        "Platform lifecycle engine".bright_black(),
        format!("[{environment}]").bright_black()
    );
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a single check record.
pub fn print_check(record: &CheckRecord) {
    let status = match record.status {
        CheckStatus::Pass => "✓".green(),
        CheckStatus::Fail => "✗".red(),
        CheckStatus::Warn => "⚠".yellow(),
        CheckStatus::Skip => "-".bright_black(),
    };
    println!("  {status} {} - {}", record.name, record.message);
}

/// Print the states a teardown passed through.
pub fn print_teardown_state(state: TeardownState, status: StepStatus) {
    let marker = match status {
        StepStatus::Ok => "✓".green(),
        StepStatus::Warn => "⚠".yellow(),
        StepStatus::Fail => "✗".red(),
        StepStatus::Skipped => "-".bright_black(),
    };
    println!(
        "{} {} {}",
        format!("[{}/{}]", state.step_number(), TeardownState::TOTAL_STEPS).bright_black(),
        marker,
        state.description().bold()
    );
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}
