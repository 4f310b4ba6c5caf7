//! Backup command - create, list, verify and restore database backups.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use tracing::info;

use lifecycle::backup::{BackupManager, BackupStatus, BackupType, EncryptionKey, RestoreRequest};
use lifecycle::ExitSignal;

use super::{cancel_on_interrupt, GlobalArgs};
use crate::ui;

/// Manage database backups.
#[derive(Args, Debug)]
pub struct BackupCommand {
    #[command(subcommand)]
    action: BackupAction,
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// Create a backup of a database.
    Create {
        /// Database to back up.
        database: String,

        /// Backup type (full, incremental).
        #[arg(long = "type", default_value = "full")]
        backup_type: BackupType,

        /// Encrypt the artifact regardless of configuration.
        #[arg(long, default_value = "false")]
        encrypt: bool,
    },

    /// List backups of a database, newest first.
    List {
        /// Database whose backups are listed.
        database: String,
    },

    /// Verify a backup without modifying it.
    Verify {
        /// Backup id.
        backup_id: String,

        /// Also restore into a scratch database.
        #[arg(long, default_value = "false")]
        test_restore: bool,
    },

    /// Restore a backup, optionally to a point in time.
    Restore {
        /// Backup id of a completed full backup.
        backup_id: String,

        /// Recovery target (RFC 3339, e.g. 2024-05-01T12:30:00Z).
        #[arg(long)]
        pitr_target: Option<DateTime<Utc>>,
    },
}

impl BackupCommand {
    /// Run the backup command.
    pub async fn run(&self, globals: &GlobalArgs) -> Result<ExitSignal> {
        let mut config = globals.load_config()?;
        if let BackupAction::Create { encrypt: true, .. } = self.action {
            config.backup.encrypt = true;
        }
        let key = EncryptionKey::from_env(&config.backup.key_env)?;
        let manager = BackupManager::new(
            globals.cluster().await?,
            globals.store(&config),
            &config,
            key,
        )?;
        let cancel = cancel_on_interrupt();

        match &self.action {
            BackupAction::Create {
                database,
                backup_type,
                ..
            } => {
                if !globals.json {
                    ui::print_step(&format!("Creating {backup_type} backup of {database}"));
                }
                let metadata = manager.create_backup(database, *backup_type, &cancel).await?;
                if globals.json {
                    GlobalArgs::print_json(&metadata)?;
                } else {
                    ui::print_success(&format!("Backup {} completed", metadata.backup_id));
                    ui::print_kv("Format", &metadata.format.to_string());
                    ui::print_kv("Location", &metadata.storage_location);
                    ui::print_kv("Size", &format!("{} bytes", metadata.size_bytes));
                    ui::print_kv("Stored", &format!("{} bytes", metadata.artifact_bytes));
                    ui::print_kv("Checksum", &metadata.checksum);
                    ui::print_kv("Encrypted", &metadata.encrypted.to_string());
                    if let Some(wal) = &metadata.wal_position {
                        ui::print_kv("WAL position", wal);
                    }
                }
                Ok(ExitSignal::Success)
            }
            BackupAction::List { database } => {
                let backups = manager.list_backups(database).await?;
                if globals.json {
                    GlobalArgs::print_json(&backups)?;
                    return Ok(ExitSignal::Success);
                }
                ui::print_section(&format!("Backups of {database}"));
                if backups.is_empty() {
                    ui::print_info("No backups found");
                }
                for backup in &backups {
                    let line = format!(
                        "{}  {:<11} {:<11} {}",
                        backup.backup_id,
                        backup.backup_type.to_string(),
                        backup.status.to_string(),
                        backup.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    match backup.status {
                        BackupStatus::Completed => ui::print_list_item(&line),
                        BackupStatus::Failed => ui::print_warning(&line),
                        BackupStatus::Pending | BackupStatus::InProgress => ui::print_info(&line),
                    }
                }
                Ok(ExitSignal::Success)
            }
            BackupAction::Verify {
                backup_id,
                test_restore,
            } => {
                let result = manager.verify_backup(backup_id, *test_restore).await?;
                if globals.json {
                    GlobalArgs::print_json(&result)?;
                } else {
                    ui::print_section(&format!("Verification of {backup_id}"));
                    for check in &result.checks {
                        ui::print_check(check);
                    }
                    println!();
                    if result.verified {
                        ui::print_success("Backup verified");
                    } else {
                        ui::print_error("Backup failed verification");
                    }
                }
                Ok(result.exit_signal())
            }
            BackupAction::Restore {
                backup_id,
                pitr_target,
            } => {
                let request = RestoreRequest {
                    backup_id: backup_id.clone(),
                    pitr_target: *pitr_target,
                };
                if !globals.json {
                    match pitr_target {
                        Some(target) => ui::print_step(&format!(
                            "Restoring {backup_id} to {}",
                            target.to_rfc3339()
                        )),
                        None => ui::print_step(&format!("Restoring {backup_id}")),
                    }
                }
                let result = manager.restore(&request, &cancel).await?;
                info!(
                    backup_id = %result.backup_id,
                    tables = result.tables_restored,
                    wal_segments = result.wal_segments_replayed,
                    "Restore finished"
                );
                if globals.json {
                    GlobalArgs::print_json(&result)?;
                } else {
                    ui::print_success(&format!(
                        "Restored {} tables in {:.1}s",
                        result.tables_restored,
                        result.duration.as_secs_f64()
                    ));
                    if result.wal_segments_replayed > 0 {
                        ui::print_kv(
                            "WAL segments replayed",
                            &result.wal_segments_replayed.to_string(),
                        );
                    }
                }
                Ok(ExitSignal::Success)
            }
        }
    }
}
