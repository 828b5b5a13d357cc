use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use jobview_engine::{AppConfig, DateFilter, JobQuery, JobService};
use jobview_storage::validate_collection_name;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobview-cli")]
#[command(about = "Deduplicated job listings: browse, inspect and clean up")]
struct Cli {
    /// YAML config file
    #[arg(long, global = true, env = "JOBVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Collection (table) to read; discovered when omitted
    #[arg(long, global = true)]
    collection: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List deduplicated jobs, newest posting first
    Jobs {
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        company: Option<String>,
        /// today, week, month or custom
        #[arg(long)]
        date: Option<String>,
        /// Day for --date custom (YYYY-MM-DD)
        #[arg(long)]
        on: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show total, duplicate and company counts
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Permanently delete every duplicate except the newest
    Cleanup {
        /// Required to actually delete
        #[arg(long)]
        yes: bool,
    },
    /// List candidate collections in the configured database
    Discover,
    /// Serve the JSON API
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(collection) = cli.collection {
        validate_collection_name(&collection).context("validating --collection")?;
        config.store.collection = Some(collection);
    }

    match cli.command.unwrap_or(Commands::Stats { json: false }) {
        Commands::Jobs {
            search,
            role,
            company,
            date,
            on,
            page,
            json,
        } => {
            let query = JobQuery {
                search,
                role,
                company,
                date: DateFilter::parse(date.as_deref(), on.as_deref())?,
                page,
            };
            let service = JobService::new(config.connector()?);
            let today = Local::now().date_naive();
            if json {
                let response = service.view_response(&query, today).await;
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            let page = service.view(&query, today).await?;
            for job in &page.jobs {
                println!(
                    "{:<40} {:<24} {:<24} {:<32} {}",
                    or_dash(&job.title),
                    or_dash(&job.company_name),
                    or_dash(&job.location),
                    or_dash(&job.posted_at_text),
                    or_dash(&job.source_url)
                );
            }
            println!(
                "page {} of {} ({} jobs)",
                page.page, page.total_pages, page.total_count
            );
        }
        Commands::Stats { json } => {
            let service = JobService::new(config.connector()?);
            if json {
                let response = service.stats_response().await;
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            let stats = service.stats().await?;
            println!(
                "jobs={} documents={} duplicates={} companies={}",
                stats.total_jobs, stats.total_documents, stats.duplicate_count, stats.total_companies
            );
        }
        Commands::Cleanup { yes } => {
            let service = JobService::new(config.connector()?);
            if !yes {
                let stats = service.stats().await?;
                println!(
                    "{} duplicate job(s) pending; re-run with --yes to delete them (keeps the newest entry per job_id)",
                    stats.duplicate_count
                );
                return Ok(());
            }
            let report = service.cleanup().await?;
            println!(
                "cleanup complete: run_id={} deleted={} kept={} collection={}",
                report.run_id, report.deleted_count, report.kept_count, report.collection
            );
            if report.is_partial() {
                eprintln!(
                    "warning: store deleted {} of {} requested duplicates; run cleanup again",
                    report.deleted_count, report.requested_count
                );
            }
        }
        Commands::Discover => {
            let service = JobService::new(config.connector()?);
            let collections = service.discover().await?;
            if collections.is_empty() {
                println!("no candidate collections found");
            }
            for name in collections {
                println!("{name}");
            }
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            jobview_web::serve(&config).await?;
        }
    }

    Ok(())
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
