use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{Config, DEFAULT_PORT};

/// The command line interface for the driver.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Port for the HTTP gateway.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Origin allowed to connect to the gateway. May be given repeatedly.
    #[arg(long = "permissible-origin", value_name = "URL")]
    pub permissible_origins: Vec<String>,

    /// Enable the mock-device routes and restrict enumeration to
    /// registered mock devices. Debug builds only.
    #[arg(long = "test-mode")]
    pub test_mode: bool,

    /// Directory to write rolling log files into.
    #[arg(long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The driver configuration these arguments describe.
    pub fn config(&self) -> Config {
        Config {
            port: self.port,
            permissible_origins: self.permissible_origins.clone(),
            test_mode: self.test_mode,
            log_dir: self.log_dir.clone(),
        }
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Firmware maintenance.
    #[clap(subcommand)]
    Firmware(FirmwareCommands),
}

/// Firmware maintenance commands.
#[derive(Subcommand, Clone)]
pub enum FirmwareCommands {
    /// Transmit a firmware image to a Senso.
    Update {
        /// Firmware image path.
        #[arg(short = 'i', value_name = "IMAGE")]
        image: PathBuf,

        /// Senso address (optional).
        #[arg(short = 'a', value_name = "ADDRESS", conflicts_with = "serial")]
        address: Option<String>,

        /// Senso serial (optional).
        #[arg(short = 's', value_name = "SERIAL")]
        serial: Option<String>,
    },
}
