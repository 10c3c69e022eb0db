use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dio_sync::{IntelConfig, IntelPipeline, ResearchOutcome};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "dio-cli")]
#[command(about = "Deal intelligence: research, scoring and scheduling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Research entities whose sources are out of cooldown, or one entity unconditionally.
    Research {
        #[arg(long)]
        entity: Option<String>,
    },
    /// Regenerate intelligence for every eligible entity.
    Score,
    /// Print notes analysis and deterministic scoring for one entity.
    Analyze {
        #[arg(long)]
        entity: String,
    },
    /// Run both cycles on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = IntelConfig::load().await?;
    let pipeline = IntelPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Research { entity: None }) {
        Commands::Research { entity: Some(id) } => match pipeline.research_entity(&id).await? {
            ResearchOutcome::Completed { sources, archived, .. } => {
                println!("research complete: entity={id} sources={} archived={archived}", sources.join(","));
            }
            ResearchOutcome::Skipped => println!("research already running for {id}"),
        },
        Commands::Research { entity: None } => {
            let report = pipeline.run_research_cycle().await?;
            println!(
                "research cycle complete: run_id={} considered={} refreshed={} cooling_down={} failed={}",
                report.run_id, report.considered, report.refreshed, report.cooling_down, report.failed
            );
        }
        Commands::Score => {
            let summary = pipeline.run_scoring_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Analyze { entity } => {
            let analysis = pipeline.analyze_entity(&entity).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set DIO_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
