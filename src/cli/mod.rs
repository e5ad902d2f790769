pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find where identifiers rank for a set of keywords
    Scan {
        /// Keyword to search (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,

        /// File with one keyword per line
        #[arg(long)]
        keywords_file: Option<PathBuf>,

        /// Identifier to look for (repeatable, up to 3)
        #[arg(short, long = "id", required = true)]
        ids: Vec<String>,

        /// Pages to scan per keyword
        #[arg(short, long)]
        max_pages: Option<u32>,

        /// Site profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Write the response as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Send the request without opening a channel
        #[arg(long)]
        one_shot: bool,

        /// Wait before each request, in milliseconds
        #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
        request_delay_ms: Option<Vec<u64>>,

        /// Backoff after a failed request, in milliseconds
        #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
        retry_delay_ms: Option<Vec<u64>>,
    },

    /// Locate an identifier in a saved listing page
    Locate {
        /// Saved listing HTML
        #[arg(long, required = true)]
        html: PathBuf,

        /// Identifier to look for
        #[arg(long, required = true)]
        id: String,

        /// Site profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

fn delay_range(values: Option<Vec<u64>>) -> Option<(u64, u64)> {
    match values.as_deref() {
        Some([min, max]) => Some((*min, *max)),
        _ => None,
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scan {
            keywords,
            keywords_file,
            ids,
            max_pages,
            profile,
            output,
            one_shot,
            request_delay_ms,
            retry_delay_ms,
        } => {
            let keywords = commands::collect_keywords(keywords, keywords_file.as_deref()).await?;
            info!("Scanning {} keywords for {} identifiers", keywords.len(), ids.len());
            commands::scan(commands::ScanArgs {
                keywords,
                identifiers: ids,
                max_pages,
                profile,
                output,
                one_shot,
                request_delay_ms: delay_range(request_delay_ms),
                retry_delay_ms: delay_range(retry_delay_ms),
            })
            .await
        },
        Commands::Locate { html, id, profile } => {
            info!("Locating {} in {}", id, html.display());
            commands::locate(html, id, profile).await
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        },
    }
}
