//! Dotfile CLI - track revisions of individual configuration files

mod commands;
mod remote;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commands::App;
use remote::RemoteClient;
use dotfile_core::Config;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dotfile")]
#[command(author = "Dotfile Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Version control for individual dotfiles")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Owner namespace for tracked files
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Read from a hosted service instead of the local store
#[derive(Args, Debug)]
struct RemoteArgs {
    /// Base URL of the service, e.g. http://localhost:8080
    #[arg(long)]
    remote: Option<String>,

    /// Owner on the service (defaults to --owner)
    #[arg(long, requires = "remote")]
    username: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start tracking a file
    Init {
        path: String,
        /// Name to track the file under (defaults to the file name)
        alias: Option<String>,
    },

    /// Record the file's current content
    Commit {
        alias: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Restore a revision to the working file
    Checkout { alias: String, hash: String },

    /// Show the commit history, newest first
    Log {
        alias: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Print the current revision
    Show {
        alias: String,
        /// Print the tracking data as JSON
        #[arg(long)]
        data: bool,
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// List tracked files
    List,

    /// Stop tracking a file and delete its history
    Forget { alias: String },

    /// Report whether the working file has uncommitted changes
    Status { alias: String },

    /// Copy a file's history into a hosted database
    Migrate {
        alias: String,
        #[arg(long)]
        database: PathBuf,
        /// Owner to create the file under in the database
        #[arg(long = "to-owner")]
        to_owner: String,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let offset = config.utc_offset()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    // Remote reads never touch the local store
    match &cli.command {
        Commands::Show {
            alias,
            data,
            remote: RemoteArgs {
                remote: Some(url),
                username,
            },
        } => {
            let client = RemoteClient::new(url)?;
            let owner = username.as_deref().unwrap_or(&cli.owner);
            remote::show(&client, owner, alias, *data, &mut out).await?;
            out.flush()?;
            return Ok(());
        }
        Commands::Log {
            alias,
            remote: RemoteArgs {
                remote: Some(url),
                username,
            },
        } => {
            let client = RemoteClient::new(url)?;
            let owner = username.as_deref().unwrap_or(&cli.owner);
            remote::log(&client, owner, alias, &offset, &mut out).await?;
            out.flush()?;
            return Ok(());
        }
        _ => {}
    }

    let app = App {
        backend: config.open_backend()?,
        owner: cli.owner,
        offset,
    };
    match cli.command {
        Commands::Init { path, alias } => app.init(&path, alias.as_deref(), &mut out)?,
        Commands::Commit { alias, message } => app.commit(&alias, &message, &mut out)?,
        Commands::Checkout { alias, hash } => app.checkout(&alias, &hash, &mut out)?,
        Commands::Log { alias, .. } => app.log(&alias, &mut out)?,
        Commands::Show { alias, data, .. } => app.show(&alias, data, &mut out)?,
        Commands::List => app.list(&mut out)?,
        Commands::Forget { alias } => app.forget(&alias, &mut out)?,
        Commands::Status { alias } => app.status(&alias, &mut out)?,
        Commands::Migrate {
            alias,
            database,
            to_owner,
        } => app.migrate(&alias, &database, &to_owner, &mut out)?,
    }
    out.flush()?;

    Ok(())
}
