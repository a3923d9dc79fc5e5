use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reunite_cli::cli::{execute, resolve_config, CliCommand, Fixture};
use reunite_core::models::{Location, MessageDraft};
use reunite_core::SessionRuntime;

#[derive(Parser)]
#[command(name = "reunite-cli")]
#[command(about = "Inspect and drive a messaging session over a JSON fixture")]
struct Cli {
    /// Fixture file with messages, users and listings
    #[arg(long, short = 'f')]
    fixture: PathBuf,

    /// User whose session to open (defaults to the fixture's viewer)
    #[arg(long, short = 'u')]
    viewer: Option<String>,

    /// Path to JSON config file (defaults to <config dir>/reunite/config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Write sends and read marks back into the fixture file
    #[arg(long)]
    persist: bool,

    /// How long to wait for in-flight writes and lookups, in milliseconds
    #[arg(long, default_value_t = 2000)]
    settle_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations, newest first
    Conversations {
        /// Only conversations with unread messages
        #[arg(long)]
        unread_only: bool,
        /// Only conversations about this listing
        #[arg(long)]
        thread: Option<String>,
    },

    /// Show one conversation and mark it read
    Thread {
        /// Listing ID
        thread_id: String,
        /// Other participant (defaults to the latest conversation on the listing)
        #[arg(long)]
        counterpart: Option<String>,
    },

    /// Send a message about a listing
    Send {
        /// Listing ID
        thread_id: String,
        /// Message text
        #[arg(default_value = "")]
        content: String,
        /// Other participant (defaults to the latest conversation, or the listing contact)
        #[arg(long)]
        counterpart: Option<String>,
        /// Photo reference to attach
        #[arg(long)]
        photo: Option<String>,
        /// Latitude of a shared location
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Longitude of a shared location
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },

    /// Mark messages read
    MarkRead {
        /// Message IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

impl From<Commands> for CliCommand {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Conversations {
                unread_only,
                thread,
            } => CliCommand::Conversations {
                unread_only,
                thread_id: thread,
            },
            Commands::Thread {
                thread_id,
                counterpart,
            } => CliCommand::Thread {
                thread_id,
                counterpart_id: counterpart,
            },
            Commands::Send {
                thread_id,
                content,
                counterpart,
                photo,
                lat,
                lon,
            } => CliCommand::Send {
                thread_id,
                counterpart_id: counterpart,
                draft: MessageDraft {
                    content,
                    photo_ref: photo,
                    location: lat.zip(lon).map(|(latitude, longitude)| Location {
                        latitude,
                        longitude,
                    }),
                },
            },
            Commands::MarkRead { ids } => CliCommand::MarkRead { ids },
        }
    }
}

#[tokio::main]
async fn main() {
    reunite_core::tracing_setup::init_tracing_with_service("reunite-cli");

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;
    let mut fixture = Fixture::load(&cli.fixture)?;
    let viewer = match cli.viewer.clone().or_else(|| fixture.viewer.clone()) {
        Some(viewer) => viewer,
        None => bail!("No viewer given: pass --viewer or set \"viewer\" in the fixture"),
    };

    let (gateway, directory) = fixture.backends();
    let mut runtime = SessionRuntime::start(config, viewer, gateway.clone(), directory)
        .await
        .context("Failed to start session")?;

    let result = execute(
        &runtime.handle(),
        cli.command.into(),
        Duration::from_millis(cli.settle_ms),
    )
    .await;
    runtime.shutdown().await;
    let output = result?;

    if cli.persist {
        fixture.messages = gateway.messages();
        fixture.save(&cli.fixture)?;
    }

    let json = if cli.pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
