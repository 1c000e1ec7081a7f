use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use siteagent::{
    Site,
    backends::ConfiguredBackends,
    config::{AgentConfig, prepare_state_dir},
};
use tokio::signal::unix::{SignalKind, signal};

mod cli;
mod database;
mod logging;

use cli::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("siteagent: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::load(&cli.key, cli.config.as_deref())?;
    logging::init(&config.log_settings()?)?;

    let mut options = config.site_options(&cli.key)?;
    options.bootstrap = cli.bootstrap;
    prepare_state_dir(&options.state_dir)?;
    let backends = ConfiguredBackends::from_config(&config)?;
    tracing::info!(backend = %backends.kind(), "Configured backends");
    let connector = database::create_connector(&config, cli.database)?;

    let mut site = Site::open(options, connector, Arc::new(backends)).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        result = site.run() => result?,
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
    }
    Ok(())
}
