use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence::clock::system_clock;
use cadence::config::Config;
use cadence::coordination::{LeaderElector, LockCoordinator};
use cadence::metrics;
use cadence::models::{ContentRecord, Platform};
use cadence::publish::{select_backend, PublishQueue};
use cadence::service::{connect_postgres, select_stores, Service};

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Leader-elected social account polling and scheduled publishing",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service: election, polling, publishing and the control plane
    Serve {
        /// Override the control plane bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one election attempt and report the outcome
    Elect {
        /// Keep the leases instead of releasing them afterwards
        #[arg(long, default_value = "false")]
        hold: bool,
    },

    /// Schedule content for publishing
    Schedule {
        /// Content id
        content_id: String,

        #[arg(long)]
        workspace: String,

        #[arg(long)]
        account: String,

        /// Target platform (instagram, facebook, threads)
        #[arg(long)]
        platform: String,

        /// Publish time (RFC 3339)
        #[arg(long)]
        at: DateTime<Utc>,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        caption: String,

        /// Media reference; repeat for a carousel
        #[arg(long = "media")]
        media: Vec<String>,
    },

    /// Cancel scheduled content
    Cancel {
        /// Content id
        content_id: String,
    },

    /// Create the PostgreSQL tables
    InitSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    // Initialize tracing/logging
    setup_tracing(&config.logging.format, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            serve(config).await?;
        }

        Commands::Elect { hold } => {
            elect(config, hold).await?;
        }

        Commands::Schedule {
            content_id,
            workspace,
            account,
            platform,
            at,
            title,
            caption,
            media,
        } => {
            let platform = Platform::parse(&platform)
                .with_context(|| format!("Unknown platform '{platform}'"))?;
            let mut record = ContentRecord::new(content_id, workspace, account, platform, at)
                .with_title(title)
                .with_caption(caption);
            record.media_refs = media;
            schedule(config, record).await?;
        }

        Commands::Cancel { content_id } => {
            cancel(config, &content_id).await?;
        }

        Commands::InitSchema => {
            connect_postgres(&config.database)
                .await
                .context("Failed to initialize schema")?;
            println!("Schema initialized");
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("cadence=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info,warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics unavailable");
    }

    let service = Service::build(config).await?;
    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;
    Ok(())
}

async fn elect(config: Config, hold: bool) -> Result<()> {
    config.validate()?;
    let stores = select_stores(&config.database).await;
    let locks = Arc::new(
        LockCoordinator::new(
            stores.leases,
            config.coordination.instance_id.clone(),
            system_clock(),
        )
        .with_renewal_interval(config.coordination.renewal_interval()),
    );
    let elector = LeaderElector::new(locks, config.coordination.clone());

    let role = elector.elect().await;
    println!("instance: {}", config.coordination.instance_id);
    println!("role:     {role}");
    println!("degraded: {}", elector.is_degraded());
    println!("leases:   {}", elector.locks().held_leases().join(", "));

    if hold && role.is_leader() {
        println!("Holding leases until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }
    elector.resign().await;
    Ok(())
}

async fn schedule(config: Config, record: ContentRecord) -> Result<()> {
    let queue = publish_queue(&config).await;
    let handle = queue.schedule(&record).await?;
    println!("{}", serde_json::to_string_pretty(&handle)?);
    Ok(())
}

async fn cancel(config: Config, content_id: &str) -> Result<()> {
    let queue = publish_queue(&config).await;
    if queue.cancel(content_id).await? {
        println!("Canceled {content_id}");
    } else {
        println!("{content_id} was not scheduled");
    }
    Ok(())
}

async fn publish_queue(config: &Config) -> PublishQueue {
    let stores = select_stores(&config.database).await;
    if !stores.shared {
        tracing::warn!("Content is only kept for the lifetime of this command");
    }
    let backend = select_backend(&config.redis).await;
    PublishQueue::new(backend, stores.content, system_clock())
}
