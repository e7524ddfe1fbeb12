mod config_commands;
mod folder_commands;

use {
    clap::{Parser, Subcommand},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "roost", about = "roost: a registry of project folders")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/roost/).
    #[arg(long, global = true, env = "ROOST_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
    /// Custom data directory holding the registry.
    #[arg(long, global = true, env = "ROOST_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Folders(folder_commands::FolderCommand),
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    // Apply directory overrides before loading config
    if let Some(ref dir) = cli.config_dir {
        roost_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        roost_config::set_data_dir(dir.clone());
    }

    debug!(version = env!("CARGO_PKG_VERSION"), "roost starting");

    match cli.command {
        Commands::Folders(command) => folder_commands::handle_folders(command).await,
        Commands::Config { action } => config_commands::handle_config(action),
    }
}
