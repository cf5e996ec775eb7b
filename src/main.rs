use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tonic::transport::Server;

mod artifacts;
mod config;
mod error;
mod facade;
mod layers;
mod logfanout;
mod model;
mod process;
mod registry;
mod runner;
mod workspace;

use crate::facade::smidr_v1::artifact_service_server::ArtifactServiceServer;
use crate::facade::smidr_v1::build_service_server::BuildServiceServer;
use crate::facade::smidr_v1::log_service_server::LogServiceServer;
use crate::facade::Facade;

#[derive(Parser)]
#[command(name = "smidrd", about = "Remote build orchestration daemon for Yocto/BitBake image builds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon, serving the BuildService/LogService/ArtifactService RPCs.
    Daemon {
        #[arg(long, default_value = ":50051")]
        address: String,
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create a smidr.yaml template in the current directory.
    Init {
        project: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { address, db_path } => run_daemon(address, db_path).await,
        Commands::Init { project } => run_init(&project),
    }
}

async fn run_daemon(address: String, db_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let registry = match &db_path {
        Some(path) => Arc::new(registry::Registry::open_durable(path)?),
        None => Arc::new(registry::Registry::new()),
    };

    let artifacts_root = config::smidr_home().join("artifacts");
    let artifacts = Arc::new(artifacts::ArtifactStore::new(artifacts_root));

    let facade = Facade::new(registry, artifacts);

    let listen_addr = normalize_address(&address).parse()?;
    tracing::info!(address = %address, durable = db_path.is_some(), "smidrd listening");

    Server::builder()
        .add_service(BuildServiceServer::new(facade.clone()))
        .add_service(LogServiceServer::new(facade.clone()))
        .add_service(ArtifactServiceServer::new(facade))
        .serve(listen_addr)
        .await?;

    Ok(())
}

/// `:50051` means "all interfaces" to a socket address parser, unlike a
/// bare gRPC target string.
fn normalize_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

fn run_init(project: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = PathBuf::from("smidr.yaml");
    if path.exists() {
        return Err(format!("{} already exists", path.display()).into());
    }
    std::fs::write(&path, config::init_template(project))?;
    println!("wrote {}", path.display());
    Ok(())
}
