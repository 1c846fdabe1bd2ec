use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobfeed_core::{analyze, unwrap_feed};
use jobfeed_storage::{Backup, FeedSource, HttpClientConfig, HttpFetcher, JobStore, ResetScope};
use jobfeed_sync::{last_schema_report, status_report, SyncConfig, SyncService, SyncStatus, Trigger};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FORMAT_ENV: &str = "JOBFEED_LOG_FORMAT";

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Job feed sync: snapshot, diff and publish")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync attempt now.
    Sync,
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the JSON interface, with the scheduled trigger when configured.
    Serve,
    /// Print the structure of the feed.
    Inspect {
        /// Show the report stored by the last sync instead of fetching.
        #[arg(long)]
        stored: bool,
    },
    /// Print last-sync metadata, advisories and recent runs.
    Status {
        #[arg(long, default_value_t = 10)]
        runs: u32,
    },
    /// Write a full backup as JSON.
    Export {
        /// Target file; stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Replace all data with the contents of a backup file.
    Import { path: PathBuf },
    /// Delete stored data.
    Reset {
        /// Only clear the live view and events so the next sync rebuilds them.
        #[arg(long)]
        events_only: bool,
    },
    /// Pin a curated name and address for a facility id.
    FacilityOverride {
        facility_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.compact().try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = JobStore::connect(&config.database_url).await?;
            let service = SyncService::from_config(&config, store)?;
            let outcome = service.sync(Trigger::Manual).await;
            println!("{}", outcome.message);
            if outcome.status == SyncStatus::Failed {
                bail!("sync failed ({})", outcome.error_kind.as_deref().unwrap_or("unknown"));
            }
        }
        Commands::Migrate => {
            let store = JobStore::connect(&config.database_url).await?;
            for (table, rows) in store.table_counts().await? {
                println!("{table}: {rows}");
            }
        }
        Commands::Serve => {
            jobfeed_web::serve_from_config(&config).await?;
        }
        Commands::Inspect { stored } => {
            let report = if stored {
                let store = JobStore::connect(&config.database_url).await?;
                match last_schema_report(&store).await? {
                    Some(report) => report,
                    None => bail!("no schema report stored yet; run a sync first"),
                }
            } else {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: config.http_timeout(),
                    user_agent: config.user_agent.clone(),
                })?;
                let document = fetcher.fetch(&config.feed_url).await?;
                analyze(&unwrap_feed(document))
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { runs } => {
            let store = JobStore::connect(&config.database_url).await?;
            let report = status_report(&store, runs).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Export { output } => {
            let store = JobStore::connect(&config.database_url).await?;
            let backup = store.export_backup(Utc::now()).await?;
            let text = serde_json::to_string_pretty(&backup)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, text)
                        .await
                        .with_context(|| format!("writing backup to {}", path.display()))?;
                    info!(path = %path.display(), "backup written");
                }
                None => println!("{text}"),
            }
        }
        Commands::Import { path } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading backup {}", path.display()))?;
            let backup = Backup::from_json(&text)?;
            let store = JobStore::connect(&config.database_url).await?;
            let service = SyncService::from_config(&config, store)?;
            service.import_backup(&backup).await?;
            for (table, rows) in service.store().table_counts().await? {
                println!("{table}: {rows}");
            }
        }
        Commands::Reset { events_only } => {
            let store = JobStore::connect(&config.database_url).await?;
            let service = SyncService::from_config(&config, store)?;
            let scope = if events_only {
                ResetScope::LiveViewAndEvents
            } else {
                ResetScope::Everything
            };
            service.reset(scope).await?;
            println!("reset complete ({scope:?})");
        }
        Commands::FacilityOverride {
            facility_id,
            name,
            address,
            notes,
        } => {
            let store = JobStore::connect(&config.database_url).await?;
            store
                .override_facility(&facility_id, &name, &address, notes.as_deref(), Utc::now())
                .await?;
            println!("facility {facility_id} pinned to {name:?}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_reset_and_override() {
        let cli = Cli::try_parse_from(["jobfeed", "reset", "--events-only"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Reset { events_only: true })));

        let cli = Cli::try_parse_from([
            "jobfeed",
            "facility-override",
            "0123456789abcdef",
            "--name",
            "Kita Nord",
            "--address",
            "Hauptstr. 1, 10115 Berlin",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::FacilityOverride { facility_id, notes, .. }) => {
                assert_eq!(facility_id, "0123456789abcdef");
                assert!(notes.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_means_sync() {
        let cli = Cli::try_parse_from(["jobfeed"]).unwrap();
        assert!(cli.command.is_none());
    }
}
