use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use azdo_reconciler::{
    Manifest, Provider, ProviderConfig,
    cli::Cli,
    logging::{LogConfig, init_logging},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::resolve(
        cli.log_level.as_deref(),
        cli.log_file.as_deref(),
        cli.log_format.as_deref(),
    )?;
    let _log_guard = init_logging(&log_config)?;

    // File config, then environment overrides
    let file_config = match &cli.config {
        Some(path) => ProviderConfig::load_from_path(path)?,
        None => ProviderConfig::load_from_file()?,
    };
    let config = file_config.merge(ProviderConfig::load_from_env());

    let manifest = Manifest::load(cli.command.manifest())?;
    let mode = cli.command.mode();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling");
            on_signal.cancel();
        }
    });

    let provider = Provider::with_default_credentials(config);
    let count = provider
        .run_manifest(manifest, mode, &cancel, |outcome| {
            let line = serde_json::to_string(outcome).context("Failed to serialize result")?;
            println!("{line}");
            Ok(())
        })
        .await?;

    info!(resources = count, ?mode, "Run complete");
    Ok(())
}
