use anyhow::Result;
use clap::Parser;
use vigil::{build_runtime, VigilArgs};
use vigil_logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = VigilArgs::parse();
    init_logging(LogConfig {
        app_name: "vigil",
        verbose: args.verbose,
    })?;

    let runtime = build_runtime(&args).await?;
    runtime.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}
