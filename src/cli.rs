// src/cli.rs

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::sync::{PushOutcome, SyncConfig, SyncManager};
use crate::AppError;

#[derive(Parser)]
#[command(name = "bodega-sync")]
#[command(about = "Cloud sync engine for the bodega point-of-sale store", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync engine until Ctrl-C (default)
    Run,

    /// Print sync status
    Status,

    /// Push the local snapshot now
    Push,

    /// Fetch the cloud snapshot
    Pull {
        /// Adopt it even when local state is newer
        #[arg(long)]
        force: bool,
    },

    /// Store cloud credentials
    Configure(ConfigureArgs),

    /// Remove cloud credentials
    Unconfigure,

    /// Write a backup file of the local state
    Backup {
        /// Target directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Replace the local state with a backup file
    Restore {
        file: PathBuf,
    },
}

#[derive(Args)]
pub struct ConfigureArgs {
    #[arg(long)]
    pub access_key: String,

    #[arg(long)]
    pub project_id: String,

    #[arg(long)]
    pub auth_domain: Option<String>,

    #[arg(long)]
    pub storage_bucket: Option<String>,

    #[arg(long)]
    pub sender_id: Option<String>,

    #[arg(long)]
    pub app_id: Option<String>,

    /// Share one cloud document between devices
    #[arg(long)]
    pub user_id: Option<String>,

    #[arg(long)]
    pub collection: Option<String>,

    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub push_interval_secs: Option<u64>,

    /// Delay between the last local edit and its push
    #[arg(long)]
    pub change_debounce_ms: Option<u64>,
}

impl ConfigureArgs {
    pub fn into_config(self) -> SyncConfig {
        let mut config = SyncConfig::new(self.access_key, self.project_id);
        config.auth_domain = self.auth_domain;
        config.storage_bucket = self.storage_bucket;
        config.sender_id = self.sender_id;
        config.app_id = self.app_id;
        config.user_id = self.user_id;
        if let Some(collection) = self.collection {
            config.collection = collection;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        if let Some(secs) = self.push_interval_secs {
            config.push_interval_secs = secs;
        }
        if let Some(ms) = self.change_debounce_ms {
            config.change_debounce_ms = ms;
        }
        config
    }
}

pub struct CliHandler {
    manager: SyncManager,
}

impl CliHandler {
    pub fn new(manager: SyncManager) -> Self {
        Self { manager }
    }

    pub async fn handle(&self, command: Commands) -> Result<(), AppError> {
        match command {
            Commands::Run => crate::run_daemon(self.manager.clone()).await?,
            Commands::Status => {
                let status = self.manager.status();
                println!("Device:   {}", self.manager.device());
                println!("State:    {:?}", self.manager.sync_state().await);
                println!("Online:   {}", status.is_online);
                println!("Syncing:  {}", status.is_syncing);
                match status.last_sync {
                    Some(at) => println!("Last sync: {}", at.to_rfc3339()),
                    None => println!("Last sync: never"),
                }
                if let Some(error) = status.last_error {
                    println!("Last error: {}", error);
                }
            }
            Commands::Push => match self.manager.push_now().await {
                PushOutcome::Synced(at) => println!("Synced at {}", at.to_rfc3339()),
                PushOutcome::Skipped(reason) => println!("Skipped: {:?}", reason),
                PushOutcome::Failed(reason) => println!("Failed: {}", reason),
            },
            Commands::Pull { force } => {
                if self.manager.pull(force).await? {
                    println!("Local state replaced with the cloud snapshot");
                } else {
                    println!("Local state is up to date");
                }
            }
            Commands::Configure(args) => {
                let state = self.manager.configure(args.into_config()).await?;
                println!("Sync {:?}", state);
            }
            Commands::Unconfigure => {
                let state = self.manager.unconfigure().await?;
                println!("Sync {:?}", state);
            }
            Commands::Backup { dir } => {
                let path = self.manager.backup_to_dir(&dir)?;
                println!("Backup written to {}", path.display());
            }
            Commands::Restore { file } => {
                let snapshot = self.manager.restore_file(&file)?;
                println!("Restored {} records from {}", snapshot.record_count(), file.display());
            }
        }
        Ok(())
    }
}
