//! Command-line harness for the AstroYou offline agent.
//!
//! Provides commands for:
//! - Precaching a live origin the way a fresh install would
//! - Rendering the notification a push payload produces
//! - Printing and checking agent configs
//!
//! ## Usage
//!
//! ```bash
//! # Precache against staging and keep the report
//! sw-harness precache --origin https://staging.astroyou.app/ --output precache.json
//!
//! # Preview a push notification and where a click would go
//! sw-harness push --payload '{"title":"Update","url":"/dashboard"}' --action open
//!
//! # Validate a deploy config
//! sw-harness config --check agent.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use astroyou_common::{init_logging, LogConfig, LogFormat, RetryConfig};
use astroyou_net::{LoaderConfig, ResourceLoader};
use astroyou_sw::{
    AgentConfig, AgentContext, Clients, Notification, NotificationClick, NotificationTray,
    PushPayload, ServiceWorkerContainer,
};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

mod report;

use report::PrecacheReport;

#[derive(Parser)]
#[command(name = "sw-harness")]
#[command(about = "Command-line harness for the AstroYou offline agent")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Debug logging with source locations
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and store the precache manifest against a live origin
    Precache {
        /// Agent config (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured origin
        #[arg(long)]
        origin: Option<String>,
        /// Retry failed installs with backoff
        #[arg(long)]
        retry: bool,
        /// Output JSON report path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the notification a push payload produces
    Push {
        /// Push payload (JSON text)
        #[arg(short, long)]
        payload: Option<String>,
        /// Agent config (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Also resolve a click with this action id
        #[arg(long)]
        action: Option<String>,
    },

    /// Print the default config, or validate one
    Config {
        /// Config file to validate
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format))
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    match cli.command {
        Commands::Precache {
            config,
            origin,
            retry,
            output,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(origin) = origin {
                config = config.with_origin(origin);
            }

            let report = precache(config, retry).await?;
            report.print_summary();

            if let Some(path) = output {
                report.write_json(&path)?;
                info!(path = %path.display(), "Report written");
            }

            if !report.succeeded() {
                std::process::exit(1);
            }
        }

        Commands::Push {
            payload,
            config,
            action,
        } => {
            let config = load_config(config.as_deref())?;
            let notification = render_push(&config, payload.as_deref());
            println!("{}", serde_json::to_string_pretty(&notification)?);

            if let Some(action) = action {
                let click = NotificationClick::new(notification, Some(action.as_str()));
                let intent = click.intent(&config.notification.default_url);
                println!("{}", serde_json::to_string_pretty(&intent)?);
            }
        }

        Commands::Config { check } => match check {
            Some(path) => match load_config(Some(path.as_path())) {
                Ok(config) => println!(
                    "{}: ok ({} precache entries, cache {})",
                    path.display(),
                    config.precache.len(),
                    config.cache_name
                ),
                Err(e) => {
                    error!("{e:#}");
                    std::process::exit(1);
                }
            },
            None => println!("{}", serde_json::to_string_pretty(&AgentConfig::default())?),
        },
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let config = match path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Install one agent version against the live origin and describe the result.
async fn precache(config: AgentConfig, retry: bool) -> anyhow::Result<PrecacheReport> {
    let loader = ResourceLoader::new(LoaderConfig::default())?;
    let clients = Arc::new(Clients::new(config.origin_url()?));
    let context = AgentContext::new(
        Arc::new(loader),
        Arc::new(NotificationTray::new()),
        clients,
    );
    let (container, mut events) = ServiceWorkerContainer::new(context);

    let cache_name = config.cache_name.clone();
    let registered = if retry {
        container
            .register_with_retry(config, &RetryConfig::install_checks())
            .await
    } else {
        container.register(config).await
    };

    while let Ok(event) = events.try_recv() {
        debug!(?event, "Lifecycle event");
    }

    let caches = container.caches();
    let caches = caches.read().await;
    let report = PrecacheReport::collect(&caches, &cache_name);

    Ok(match registered {
        Ok(worker) => report.with_worker(worker),
        Err(e) => report.with_error(e),
    })
}

fn render_push(config: &AgentConfig, payload: Option<&str>) -> Notification {
    let payload = PushPayload::parse(payload.map(str::as_bytes));
    Notification::from_payload(&payload, &config.notification)
}
