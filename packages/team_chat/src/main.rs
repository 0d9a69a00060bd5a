use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use team_chat::cli;
use team_chat::config::TeamChatConfig;

#[derive(Parser)]
#[command(name = "team-chat")]
#[command(about = "Read and write team chat channels from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.team-chat)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List channels you can read
    Channels(ChannelsArgs),

    /// Print a channel's recent history
    History(HistoryArgs),

    /// Follow a channel live and send messages
    Open(OpenArgs),
}

#[derive(Parser)]
struct ChannelsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    /// Channel ID
    channel: String,

    /// Number of pages to load, newest first
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pages: u32,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct OpenArgs {
    /// Channel ID
    channel: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "team_chat=debug,message_stream=debug,info"
    } else {
        "team_chat=warn,message_stream=warn,error"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = TeamChatConfig::new(cli.config_dir)?;

    match cli.command {
        Commands::Channels(args) => cli::channels_command(&config, args.json).await,
        Commands::History(args) => {
            cli::history_command(&config, &args.channel, args.pages, args.json).await
        }
        Commands::Open(args) => cli::open_command(&config, &args.channel).await,
    }
}
