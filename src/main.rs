mod demo;
mod doctor;
mod notary;

use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice_core::config::AppConfig;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Dependency-triggered pipeline engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sluice.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the pipeline and run it until Ctrl-C
    Run {
        /// Stop on its own after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Show current configuration
    Config,
    /// Print the pipeline snapshot as JSON and exit
    Snapshot,
    /// Run system health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "sluice", &mut std::io::stdout());
        return Ok(());
    }

    // Load config
    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        let home_config = dirs_home().map(|h| h.join(".sluice").join("config.toml"));
        match home_config {
            Some(ref path) if path.exists() => {
                info!(path = %path.display(), "Loading config from home directory");
                AppConfig::load(path)?
            }
            _ => {
                eprintln!(
                    "Warning: No config file found at {}, using defaults",
                    cli.config.display()
                );
                AppConfig::default()
            }
        }
    };

    // Snapshot only reads stored state
    if !matches!(cli.command, Some(Commands::Snapshot)) {
        std::fs::create_dir_all(config.workspace_dir())?;
    }

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Doctor) => {
            println!("Sluice doctor");
            println!();
            doctor::run_doctor(&config);
        }
        Some(Commands::Snapshot) => {
            let demo = demo::inspect(&config)?;
            println!("{}", serde_json::to_string_pretty(&demo.pipeline.snapshot()?)?);
        }
        Some(Commands::Run { duration }) => run(&config, duration).await?,
        None => run(&config, None).await?,
        Some(Commands::Completions { .. }) => unreachable!(),
    }

    Ok(())
}

async fn run(config: &AppConfig, duration: Option<u64>) -> anyhow::Result<()> {
    let demo = demo::build(config)?;
    let pipeline = &demo.pipeline;

    pipeline.start()?;
    info!(
        pipeline = %pipeline.name(),
        workspace = %config.workspace_dir().display(),
        "Pipeline running, press Ctrl-C to stop"
    );

    match duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
        }
    }

    info!("Shutting down pipeline...");
    pipeline.stop().await;

    let snapshot = pipeline.snapshot()?;
    println!();
    for node in &snapshot.nodes {
        match node.artifacts {
            Some(counts) => println!(
                "  {:<20} {:<10} epoch {:<4} new {} / current {} / old {}",
                node.name,
                node.state.to_string(),
                node.epoch,
                counts.new,
                counts.current,
                counts.old
            ),
            None => println!(
                "  {:<20} {:<10} epoch {}",
                node.name,
                node.state.to_string(),
                node.epoch
            ),
        }
    }
    let finished = snapshot.runs.iter().filter(|r| !r.run.is_active()).count();
    println!();
    println!(
        "  {} runs recorded in {} ({} finished)",
        snapshot.runs.len(),
        demo.metadata.name(),
        finished
    );
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
