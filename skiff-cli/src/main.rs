use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;
mod commands;
mod config;
mod manifest;
mod presenter;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Build and deploy applications through the skiff daemon", long_about = None)]
struct Cli {
    /// Daemon address (host:port); overrides the configured value
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package the app directory and deploy it
    Up {
        /// Path to the application directory (defaults to the current one)
        path: Option<String>,

        /// Manifest environment to deploy
        #[arg(short, long, default_value = manifest::DEFAULT_ENVIRONMENT)]
        environment: String,

        /// Redeploy on local file changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Print persisted logs for a build
    Logs {
        /// Application name
        app: String,

        /// Build identifier
        build_id: String,

        /// Only the last N lines (0 = everything)
        #[arg(short, long, default_value = "0")]
        limit: i64,
    },

    /// Print client and server versions
    Version,

    /// Manage client configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one value
    Get { key: String },

    /// Set one value
    Set { key: String, value: String },

    /// Remove one value
    Unset { key: String },

    /// Print every configured value
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let server = cli.server.as_deref();

    match cli.command {
        Commands::Up { path, environment, watch } => {
            commands::up(path.as_deref(), &environment, server, watch).await?;
        }

        Commands::Logs { app, build_id, limit } => {
            let cfg = config::Config::load()?;
            let mut client = client::SkiffClient::connect(&cfg.server_addr(server)).await?;
            commands::logs(&mut client, &app, &build_id, limit).await?;
        }

        Commands::Version => {
            let cfg = config::Config::load()?;
            commands::version(&cfg.server_addr(server)).await?;
        }

        Commands::Config(config_cmd) => {
            let mut cfg = config::Config::load()?;
            match config_cmd {
                ConfigCommands::Get { key } => commands::config::get(&cfg, &key)?,
                ConfigCommands::Set { key, value } => commands::config::set(&mut cfg, &key, &value)?,
                ConfigCommands::Unset { key } => commands::config::unset(&mut cfg, &key)?,
                ConfigCommands::List => commands::config::list(&cfg),
            }
        }
    }

    Ok(())
}
