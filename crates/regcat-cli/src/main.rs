use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use regcat_adapters::{discover, MatchPolicy, SelectionPolicy};
use regcat_storage::HttpFetcher;
use regcat_sync::{run_registry, EngineSettings, PipelineRegistry, RegistrySummary};
use regex::Regex;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "regcat")]
#[command(about = "Republishes spreadsheet catalogs from source pages into a SQLite store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Pipeline registry file (overrides REGCAT_REGISTRY).
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled pipeline, or just one.
    Run {
        #[arg(long)]
        pipeline: Option<String>,
        /// Print run outcomes as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List registered pipelines.
    List,
    /// Show the candidate links on a page and which one would be selected.
    Discover {
        url: String,
        #[arg(long = "ext", value_delimiter = ',')]
        extensions: Vec<String>,
        #[arg(long, default_value_t = SelectionPolicy::ExtensionPreference)]
        policy: SelectionPolicy,
        #[arg(long)]
        pattern: Option<String>,
    },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,regcat_sync=debug,regcat_adapters=debug,regcat_storage=debug,regcat_core=debug",
        _ => "debug,regcat_sync=trace,regcat_adapters=trace,regcat_storage=trace,regcat_core=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn settings_for(cli: &Cli) -> EngineSettings {
    let mut settings = EngineSettings::from_env();
    if let Some(path) = &cli.registry {
        settings.registry_path = path.clone();
    }
    settings
}

fn print_summary(summary: &RegistrySummary) {
    for outcome in &summary.outcomes {
        match &outcome.failure {
            None => println!(
                "ok    {:<24} rows={} link={} run_id={}",
                outcome.pipeline_id,
                outcome.rows_written,
                outcome.selected_link.as_deref().unwrap_or("-"),
                outcome.run_id
            ),
            Some(failure) => println!(
                "FAIL  {:<24} stage={} reason={} run_id={}",
                outcome.pipeline_id,
                failure.stage(),
                failure.reason(),
                outcome.run_id
            ),
        }
        for warning in &outcome.cleanup_warnings {
            println!("      cleanup warning: {warning}");
        }
    }
    if !summary.skipped.is_empty() {
        println!("skipped: {}", summary.skipped.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let settings = settings_for(&cli);
    debug!(?settings, "engine settings");

    match cli.command.unwrap_or(Commands::Run {
        pipeline: None,
        json: false,
    }) {
        Commands::Run { pipeline, json } => {
            let registry = PipelineRegistry::load(&settings.registry_path).await?;
            let engine = settings.build_engine()?;
            let summary = run_registry(&engine, &settings, &registry, pipeline.as_deref()).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run outcomes")?
                );
            } else {
                print_summary(&summary);
            }

            let failed = summary.failed().count();
            if failed > 0 {
                bail!("{failed} pipeline(s) failed");
            }
        }
        Commands::List => {
            let registry = PipelineRegistry::load(&settings.registry_path).await?;
            for p in &registry.pipelines {
                println!(
                    "{:<24} {:<8} table={:<24} transform={:<14} {}",
                    p.pipeline_id,
                    if p.enabled { "enabled" } else { "disabled" },
                    p.table_name,
                    p.transform,
                    p.source_url
                );
            }
        }
        Commands::Discover {
            url,
            extensions,
            policy,
            pattern,
        } => {
            let name_pattern = pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context("invalid --pattern")?;
            let match_policy = MatchPolicy::new(extensions.as_slice())?
                .with_name_pattern(name_pattern)
                .with_selection(policy);
            let fetcher = HttpFetcher::new(settings.http_client_config())?;
            let found = discover(&fetcher, &url, &match_policy).await?;

            for candidate in &found.candidates {
                let marker = if candidate.url == found.selected.url { "*" } else { " " };
                println!(
                    "{marker} [{}] {:<5} {} {}",
                    candidate.position,
                    candidate.extension,
                    candidate.url,
                    candidate.anchor_text.as_deref().unwrap_or("")
                );
            }
            println!("selected ({policy}): {}", found.selected.url);
        }
    }

    Ok(())
}
