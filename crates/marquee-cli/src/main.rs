//! Marquee - a command-line client for the casting marketplace.
//!
//! Drives the session manager from `marquee-core` against a live API: log in
//! and out, inspect or watch the session, refresh tokens and edit the
//! signed-in profile.

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{AppContext, StoreChoice};

#[derive(Debug, Parser)]
#[command(name = "marquee", version, about = "Casting marketplace session client")]
struct Cli {
    /// API base URL (overrides MARQUEE_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Keep credentials in memory only; nothing is written to disk
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Store credentials as plain JSON instead of encrypting them
    #[arg(long, global = true, conflicts_with = "ephemeral")]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the stored session and show who is logged in
    Status,
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Log out locally and revoke the refresh token on the server
    Logout,
    /// Exchange the refresh token for a new access token
    Refresh,
    /// Print the signed-in user's full profile
    Profile,
    /// Edit the signed-in user's profile
    Update {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Stay running and report session changes until Ctrl-C
    Watch,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();
    info!(command = ?cli.command, "marquee starting");

    let store = if cli.ephemeral {
        StoreChoice::Memory
    } else if cli.plain {
        StoreChoice::Plain
    } else {
        StoreChoice::Configured
    };
    let mut ctx = AppContext::build(cli.api_url.as_deref(), store)?;

    let result = match cli.command {
        Command::Status => commands::status(&ctx).await,
        Command::Login { email } => commands::login(&mut ctx, email).await,
        Command::Logout => commands::logout(&ctx).await,
        Command::Refresh => commands::refresh(&ctx).await,
        Command::Profile => commands::profile(&ctx).await,
        Command::Update {
            first_name,
            last_name,
            email,
        } => commands::update(&ctx, first_name, last_name, email).await,
        Command::Watch => commands::watch(&ctx).await,
    };

    ctx.session.shutdown();
    result
}
