use clap::Parser;
use color_eyre::Result;
use serial_bridge::{
    cli, config::Config, facade::Facade, logging,
    serial::driver::SystemOpener, server,
};
use tracing::{debug, error, info, Level};

/// Closes every session when the main task unwinds, so port handles never
/// outlive the agent even on a panic.
struct ShutdownGuard(Facade);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.close_all();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)
    } else {
        debug!("Default config");
        Config::default()
    };

    let stdout_level = logging::parse_level(&config.logging.level).unwrap_or(Level::INFO);
    let file_logging = config
        .logging
        .directory
        .clone()
        .map(|directory| (Level::DEBUG, directory));
    logging::init(stdout_level, file_logging).await;

    let facade = server::build(config.clone(), Box::new(SystemOpener));
    let _guard = ShutdownGuard(facade.clone());

    #[cfg(unix)]
    {
        let mut hangup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
            _ = server::run_with(facade.clone(), config, cli.port) => {
                error!("Server returned");
                return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = server::run_with(facade.clone(), config, cli.port) => {
                error!("Server returned");
                return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
            }
        }
    }

    logging::shutdown();

    Ok(())
}
