//! Platform lifecycle CLI.
//!
//! Validates a deployed platform, manages database backups and tears
//! environments down behind confirmation gates.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

use commands::backup::BackupCommand;
use commands::teardown::TeardownCommand;
use commands::validate::ValidateCommand;
use commands::GlobalArgs;
use lifecycle::{ExitSignal, LifecycleError};

/// Platform lifecycle engine.
#[derive(Parser)]
#[command(
    name = "lifecycle",
    version,
    about = "Validate, back up and tear down platform environments",
    long_about = "Operate a deployed platform environment.\n\n\
                  Exit codes: 0 success, 1 critical failure, 2 important failure\n\
                  or completed with errors, 3 aborted or cancelled, 4 operational error."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the deployed platform.
    ///
    /// Runs prerequisite, cluster, service, database, security, network and
    /// resource checks in order and reports overall health.
    Validate(ValidateCommand),

    /// Create, list, verify and restore database backups.
    Backup(BackupCommand),

    /// Tear down an environment.
    ///
    /// Drains workloads, deletes namespaces and, with --scope full,
    /// initiates deletion of cloud resources.
    Teardown(TeardownCommand),
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "info,lifecycle=debug"
    } else {
        "warn,lifecycle=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let result = match &cli.command {
        Commands::Validate(cmd) => cmd.run(&cli.globals).await,
        Commands::Backup(cmd) => cmd.run(&cli.globals).await,
        Commands::Teardown(cmd) => cmd.run(&cli.globals).await,
    };

    let signal = match result {
        Ok(signal) => signal,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            e.downcast_ref::<LifecycleError>()
                .map_or(ExitSignal::Error, ExitSignal::for_error)
        }
    };
    signal.into()
}
