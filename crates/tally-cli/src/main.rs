use anyhow::Result;
use clap::{Parser, Subcommand};
use tally_storage::{JsonRegistryStore, RegistryStore};
use tally_sync::IngestConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tally-cli")]
#[command(about = "Alliance roster tally command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over the configured event folders.
    Ingest,
    /// Run ingestion on the configured cron schedule until interrupted.
    Schedule,
    /// Print the persisted entity registry.
    Registry,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = tally_sync::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} workbooks={} sheets={} snapshots={} entities_created={}",
                summary.run_id,
                summary.workbooks_processed,
                summary.sheets_processed,
                summary.snapshots_committed,
                summary.entities_created
            );
            if summary.batches_failed > 0 {
                println!(
                    "warning: {} batch(es) failed, {} snapshot(s) discarded",
                    summary.batches_failed, summary.snapshots_discarded
                );
            }
            if summary.rows_skipped_invalid > 0 || summary.sheets_skipped_undated > 0 {
                println!(
                    "skipped: {} row(s) without identity fields, {} undated sheet(s)",
                    summary.rows_skipped_invalid, summary.sheets_skipped_undated
                );
            }
        }
        Commands::Schedule => {
            let mut config = IngestConfig::from_env();
            config.scheduler_enabled = true;
            let scheduler = tally_sync::maybe_build_scheduler(&config)
                .await?
                .expect("scheduler enabled above");
            scheduler.start().await?;
            println!(
                "scheduler running ({} / {}); press ctrl-c to stop",
                config.ingest_cron_1, config.ingest_cron_2
            );
            tokio::signal::ctrl_c().await?;
        }
        Commands::Registry => {
            let config = IngestConfig::from_env();
            let store = JsonRegistryStore::new(config.registry_path.clone());
            match store.load().await? {
                Some(registry) => {
                    println!(
                        "registry: {} profile(s) at {}",
                        registry.len(),
                        config.registry_path.display()
                    );
                    for profile in registry.profiles() {
                        println!(
                            "  {} {} ids={} names={} events={} last_seen={}",
                            profile.entity_id,
                            profile.primary_name,
                            profile.known_ids.len(),
                            profile.known_names.len(),
                            profile.active_events.len(),
                            profile.last_seen_event
                        );
                    }
                }
                None => println!(
                    "no registry found at {}",
                    config.registry_path.display()
                ),
            }
        }
    }

    Ok(())
}
