pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug detail for the crawler
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl product pages, or the products of a category
    Crawl {
        /// Product page URLs, or one category URL with --category
        #[arg(required = true)]
        urls: Vec<String>,

        /// Treat the URL as a category entry point and discover its products
        #[arg(short, long)]
        category: bool,

        /// Site profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Maximum number of products to crawl
        #[arg(short, long)]
        limit: Option<u32>,

        /// Browser sessions the job may use at once
        #[arg(short, long)]
        sessions: Option<usize>,

        /// Write the merged records to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Continue an interrupted job from its last progress snapshot
    Resume {
        #[arg(required = true)]
        job_id: String,

        #[arg(short, long, default_value = "default")]
        profile: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the persisted progress of a job
    Status {
        #[arg(required = true)]
        job_id: String,

        #[arg(short, long, default_value = "default")]
        profile: String,
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

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { urls, category, profile, limit, sessions, output } => {
            info!("Starting crawl of {} URL(s) with profile {}", urls.len(), profile);
            let request = commands::CrawlRequest {
                urls,
                category,
                profile,
                limit,
                sessions,
                output,
            };
            commands::crawl(request).await
        }
        Commands::Resume { job_id, profile, output } => {
            info!("Resuming job {} with profile {}", job_id, profile);
            commands::resume(&job_id, &profile, output).await
        }
        Commands::Status { job_id, profile } => commands::status(&job_id, &profile).await,
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        }
    }
}
