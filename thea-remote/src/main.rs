mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "thea-remote", about = "Thea remote desktop host service")]
pub struct Cli {
    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable debug logging (repeat for trace)
    #[arg(long, short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,
    /// Validate the configuration file
    Check,
    /// Set up a TOTP second factor and print the recovery codes
    Otp,
    /// Store the unattended-access password
    SetPassword {
        password: String,
    },
    /// Store the shared secret used by the shared-secret auth method
    SetSecret {
        secret: String,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            dirs_fallback_data_dir()
                .join("thea-remote")
                .join("config.json")
        })
    }
}

fn dirs_fallback_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug)?;

    match &cli.command {
        Commands::Run => commands::run::command(&cli).await,
        Commands::Check => commands::check::command(&cli).await,
        Commands::Otp => commands::otp::command(&cli).await,
        Commands::SetPassword { password } => {
            commands::secrets::set_password(&cli, password).await
        }
        Commands::SetSecret { secret } => commands::secrets::set_secret(&cli, secret).await,
    }
}
