use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arl::config::Settings;

#[derive(Parser)]
#[command(name = "arl")]
#[command(about = "Kubernetes-native warm-pool command sandboxes for AI agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the warm-pool and sandbox controllers
    Operator,
    /// Run the session gateway (HTTP + WebSocket)
    Gateway,
    /// Run the in-pod sidecar (health + RPC bridge)
    Sidecar,
    /// Print the CRD manifests as YAML
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Operator => arl::operator::run(settings).await,
        Commands::Gateway => arl::gateway::run(settings).await,
        Commands::Sidecar => arl::sidecar::run(settings).await,
        Commands::Crd => {
            print!("{}", arl::operator::crd_manifests()?);
            Ok(())
        }
    }
}
