use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pw_engine::{http_engine, EngineConfig, WakeupSchedule};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pagewatch")]
#[command(about = "Watches incident pages and alerts on content changes")]
struct Cli {
    /// Settings file (YAML).
    #[arg(long, default_value = "watch.yaml")]
    config: PathBuf,

    /// Persisted fingerprint state.
    #[arg(long, default_value = "state/watch-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single poll cycle and exit.
    Check,
    /// Poll on the configured interval until interrupted.
    Watch {
        /// Also serve the web surface.
        #[arg(long)]
        serve: bool,
    },
    /// Serve the web surface only.
    Serve,
    /// Print the current per-identifier status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig {
        settings_path: cli.config.clone(),
        state_path: cli.state.clone(),
        ..EngineConfig::default()
    };
    let engine = http_engine(config)?;

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => match engine.run_cycle().await? {
            Some(summary) => println!(
                "cycle complete: checked={} changed={} cancelled={}",
                summary.checked, summary.changed_count, summary.cancelled
            ),
            None => println!("nothing to do: polling disabled or no identifiers configured"),
        },
        Commands::Watch { serve } => {
            let settings = engine.load_effective_settings().await?;
            let schedule =
                WakeupSchedule::start(Arc::clone(&engine), settings.interval_minutes()).await?;
            schedule.poke_soon().await?;
            info!(
                interval_minutes = settings.interval_minutes(),
                identifiers = settings.normalized_identifiers().len(),
                "watching"
            );
            if serve {
                tokio::select! {
                    result = pw_web::serve_from_env(Arc::clone(&engine)) => result?,
                    _ = tokio::signal::ctrl_c() => {}
                }
            } else {
                tokio::signal::ctrl_c().await?;
            }
            schedule.shutdown().await?;
        }
        Commands::Serve => {
            pw_web::serve_from_env(engine).await?;
        }
        Commands::Status => {
            let view = engine.state_view().await?;
            println!("scheduler: {:?}", view.status);
            if let Some(at) = view.last_cycle_at {
                println!("last cycle: {at}");
            }
            for identifier in view.settings.normalized_identifiers() {
                let record = view.records.get(&identifier).cloned().unwrap_or_default();
                let disposition = match &record.last_status {
                    Some(status) if status.ok && status.changed => "changed",
                    Some(status) if status.ok => "unchanged",
                    Some(status) if status.is_inconclusive() => "no content yet",
                    Some(_) => "failed",
                    None => "not checked",
                };
                let checked_at = record
                    .last_check_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let note = record.last_status.map(|status| status.note).unwrap_or_default();
                println!("{identifier:<16} {disposition:<14} {checked_at:<26} {note}");
            }
        }
    }

    Ok(())
}
