mod output;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use modhost_config::{config_dir, config_file_path, load_and_prepare, ModHostConfig};
use modhost_core::HostUser;
use modhost_logging::init_logger;
use modhost_plugins::{global, Orchestrator};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "modhost")]
#[command(about = "modhost: load, sequence and run remotely hosted script modules")]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/modhost/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Sources {
    /// Repository document URL; may be repeated
    #[arg(short, long = "repo")]
    repos: Vec<String>,

    /// Module script URL loaded in addition to repository entries
    #[arg(short, long = "module")]
    modules: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, start and keep modules running until Ctrl-C
    Run {
        #[command(flatten)]
        sources: Sources,

        /// Dispatch a login for this user id once modules are started
        #[arg(long)]
        login: Option<String>,
    },
    /// Load modules without starting them and report their metadata
    Check {
        #[command(flatten)]
        sources: Sources,

        /// Print summaries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(|| config_file_path(&config_dir()));
    let config = load_and_prepare(&path).await?;

    let logging = config.logging();
    let _log_guard = init_logger(
        logging.dir.as_deref().map(Path::new),
        logging.level.as_deref().unwrap_or("info"),
    );

    match cli.command {
        Commands::Run { sources, login } => run(&config, sources, login).await,
        Commands::Check { sources, json } => check(&config, sources, json).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config).context("Failed to render config")?);
            Ok(())
        }
    }
}

/// Resolve repositories and load every module they list plus the loose
/// module URLs. Command-line sources come after the configured ones.
async fn load_sources(orchestrator: &Orchestrator, config: &ModHostConfig, sources: Sources) -> Result<usize> {
    let repos: Vec<String> = config.repositories.iter().cloned().chain(sources.repos).collect();
    let mut urls: Vec<String> = Vec::new();
    for repo in &repos {
        match orchestrator.fetch_repository(repo).await {
            Ok(descriptor) => urls.extend(descriptor.enabled_urls()),
            Err(e) => output::note_warn(&format!("repository {repo} skipped: {e}")),
        }
    }
    urls.extend(config.modules.iter().cloned());
    urls.extend(sources.modules);
    let mut seen = HashSet::new();
    urls.retain(|url| seen.insert(url.clone()));

    if urls.is_empty() {
        anyhow::bail!("nothing to load: pass --repo/--module or list repositories in the config");
    }
    let loaded = orchestrator.load_urls(&urls).await;
    info!(requested = urls.len(), loaded = loaded.len(), "Load pass complete");
    Ok(loaded.len())
}

async fn run(config: &ModHostConfig, sources: Sources, login: Option<String>) -> Result<()> {
    let orchestrator = global::init(Orchestrator::builder().config(config).build()?);
    let loaded = load_sources(&orchestrator, config, sources).await?;
    output::note_info(&format!("{loaded} module(s) loaded"));

    let report = orchestrator.start_all().await;
    output::print_start_report(&report);
    print!("{}", output::module_table(&orchestrator.modules()));

    if let Some(id) = login {
        let user = HostUser { id: id.clone(), display_name: id };
        let failures = orchestrator.handle_login(&user).await;
        if failures > 0 {
            warn!(failures, "Some modules rejected the login");
        }
    }

    output::note_info("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    shutdown(orchestrator).await;
    Ok(())
}

async fn shutdown(orchestrator: Arc<Orchestrator>) {
    let stopped = orchestrator.stop_all().await;
    global::reset();
    output::note_success(&format!("{stopped} module(s) stopped"));
}

async fn check(config: &ModHostConfig, sources: Sources, json: bool) -> Result<()> {
    let orchestrator = Orchestrator::builder().config(config).build()?;
    load_sources(&orchestrator, config, sources).await?;

    let modules = orchestrator.modules();
    if json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
    } else {
        print!("{}", output::module_table(&modules));
    }
    let failed: Vec<String> = orchestrator.pipeline().failed_urls();
    if !failed.is_empty() {
        for url in &failed {
            output::note_warn(&format!("failed: {url}"));
        }
        anyhow::bail!("{} module URL(s) failed to load", failed.len());
    }
    Ok(())
}
