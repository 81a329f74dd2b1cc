use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden::config::EcosystemFile;
use warden::process::AppSupervisor;

/// Warden - keeps the apps of an ecosystem file running
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Ecosystem file (.toml or .json)
    config: PathBuf,

    /// Supervise only the app with this name
    #[arg(short, long)]
    app: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let ecosystem = EcosystemFile::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let specs = match cli.app {
        Some(ref name) => match ecosystem.app(name) {
            Some(spec) => vec![spec.clone()],
            None => bail!("no app named '{}' in {}", name, cli.config.display()),
        },
        None => ecosystem.apps,
    };

    let mut supervisors = Vec::with_capacity(specs.len());
    let mut printers = JoinSet::new();

    for spec in specs {
        let supervisor = AppSupervisor::new(spec)?;
        let app = supervisor.name();
        let mut events = supervisor.subscribe();

        printers.spawn(async move {
            while let Some(event) = events.recv().await {
                println!("[{}] {}", app, event);
            }
        });

        supervisor.start().await?;
        supervisors.push(supervisor);
    }

    info!(apps = supervisors.len(), "supervising; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutting down");
    for supervisor in &supervisors {
        if let Err(e) = supervisor.stop().await {
            error!(app = %supervisor.name(), "stop failed: {}", e);
        }
    }

    for supervisor in &supervisors {
        for state in supervisor.status() {
            println!("{} #{}: {}", supervisor.name(), state.slot, state.status);
        }
    }

    // Event streams end once the supervisors and their actors are gone
    drop(supervisors);
    while printers.join_next().await.is_some() {}

    Ok(())
}
