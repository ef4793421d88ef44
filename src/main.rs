use clap::Parser;
use color_eyre::Result;
use senso_bridge::cli::{Cli, Commands, FirmwareCommands};
use senso_bridge::{firmware, logging, server};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    if let Some(Commands::Firmware(FirmwareCommands::Update {
        image,
        address,
        serial,
    })) = cli.command
    {
        if let Err(e) = firmware::run_update(&image, address, serial).await {
            println!();
            println!("Update failed: {e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = cli.config();
    let file_logging = config.log_dir.clone().map(|dir| (Level::DEBUG, dir));
    logging::init(Level::INFO, file_logging).await;

    #[cfg(unix)]
    let mut hangup = signal(SignalKind::hangup())?;

    #[cfg(unix)]
    let hangup = hangup.recv();

    #[cfg(not(unix))]
    let hangup = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup => {
            info!("Told to hang up, quitting")
        }
        _ = server::run_configured(config) => {
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    logging::shutdown();

    Ok(())
}
