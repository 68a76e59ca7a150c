//! Camera to KMS scanout

use std::path::PathBuf;

use color_eyre::Result;
use scanout::pipeline::Pipeline;
use scanout::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scanout=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Scanout launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(
        "Capturing {} {}x{} from {}",
        config.capture.format,
        config.capture.width,
        config.capture.height,
        config.capture.device.display()
    );

    let mut pipeline = Pipeline::open(config)?;
    pipeline.run(None)?;

    info!("Scanout shutting down");
    Ok(())
}
