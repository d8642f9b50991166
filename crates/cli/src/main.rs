use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trunchbull_core::config::{LogFormat, LoggingConfig, TrunchbullConfig};

mod commands;

#[derive(Parser)]
#[command(name = "trunchbull", about = "Unified student dashboard over Schoology and PowerSchool", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "trunchbull.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a default configuration and create the database
    Init {
        /// Directory holding the SQLite database
        #[arg(long, default_value = "./data")]
        data_dir: String,
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP API and the background sync scheduler
    Serve {
        /// Port to listen on (overrides `[server] port`)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a sync now, for one student or for everyone
    Sync {
        /// Student id; all students when omitted
        #[arg(long)]
        student: Option<String>,
    },
    /// Show per-provider sync status
    Status {
        /// Student id; all students when omitted
        #[arg(long)]
        student: Option<String>,
    },
}

fn init_logging(config_path: &str) {
    // Logging settings come from the config file when it is readable.
    let logging = TrunchbullConfig::load(Path::new(config_path))
        .map(|c| c.logging)
        .unwrap_or_else(|_| LoggingConfig::default());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.config);

    match cli.command {
        Commands::Init { data_dir, force } => {
            commands::init::run(&cli.config, &data_dir, force).await?;
        }
        Commands::Serve { port } => {
            commands::serve::run(&cli.config, port).await?;
        }
        Commands::Sync { student } => {
            commands::sync::run(&cli.config, student.as_deref()).await?;
        }
        Commands::Status { student } => {
            commands::status::run(&cli.config, student.as_deref()).await?;
        }
    }

    Ok(())
}
