use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(about = "Concept review workflows with parallel analysis and human approval", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conclave.toml", env = "CONCLAVE_CONFIG")]
    config: PathBuf,

    /// Data directory for generated reports
    #[arg(short, long, default_value = "./data", env = "CONCLAVE_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conclave=info,conclave_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Conclave");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    if let Some(secs) = config.engine.approval_timeout_secs {
        tracing::info!(
            "Approval timeout: {}s ({:?} on expiry)",
            secs,
            config.engine.timeout_policy
        );
    }
    tracing::info!("Upload directory: {}", config.upload_path().display());

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
