use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gitvault::{BackupEngine, BackupResult, Config, GitSource, RunOptions};

#[derive(Parser)]
#[command(name = "gitvault")]
#[command(about = "Durable mirror of remote git repositories with full reference history")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up all configured sources (the default command)
    Run {
        /// Back up only this source
        #[arg(long)]
        source: Option<String>,

        /// Overwrite diverged refs after backing up the old target
        #[arg(long)]
        accept_diverged: bool,
    },

    /// List repositories visible to the configured sources
    List {
        /// List only this source
        #[arg(long)]
        source: Option<String>,

        /// Show clone URLs
        #[arg(long)]
        details: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;
    init_logging(cli.verbose, &config);

    info!("Starting gitvault v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        None => cmd_run(None, false, config).await,
        Some(Commands::Run {
            source,
            accept_diverged,
        }) => cmd_run(source, accept_diverged, config).await,
        Some(Commands::List { source, details }) => cmd_list(source, details, &config).await,
    }
}

/// Initialize logging from the verbosity flag and the configured level
fn init_logging(verbose: bool, config: &Config) {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Back up every configured source
async fn cmd_run(source: Option<String>, accept_diverged: bool, config: Config) -> Result<()> {
    let engine = BackupEngine::new(config)?;
    let options = RunOptions {
        source,
        accept_diverged,
    };

    let summary = engine.run(&options).await?;

    println!("\n📦 Backup complete in {:.2}s", summary.duration.as_secs_f64());
    println!(
        "   Repositories: {} backed up, {} failed",
        summary.repos_completed(),
        summary.repos_failed()
    );
    println!(
        "   References: {} created, {} fast-forwarded, {} replaced, {} unchanged, {} diverged (skipped), {} failed",
        summary.refs_created(),
        summary.refs_fast_forwarded(),
        summary.refs_replaced(),
        summary.refs_unchanged(),
        summary.refs_skipped(),
        summary.ref_failures()
    );

    if summary.refs_skipped() > 0 {
        println!("\n💡 Diverged refs were left untouched; rerun with --accept-diverged to replace them (the old target is always backed up first)");
    }

    if !summary.is_clean() {
        println!("\n🔍 Failures:");
        for failure in &summary.failed_sources {
            println!("   ❌ source {}: {}", failure.source, failure.error);
        }
        for result in &summary.results {
            match result {
                BackupResult::Failed { repo, error } => {
                    println!("   ❌ {}: {}", repo.full_name, error);
                }
                BackupResult::Completed { repo, report } => {
                    for failure in &report.failures {
                        println!("   ❌ {} {}: {}", repo.full_name, failure.name, failure.error);
                    }
                }
            }
        }
    }

    Ok(())
}

/// List repositories without backing anything up
async fn cmd_list(source: Option<String>, details: bool, config: &Config) -> Result<()> {
    let mut matched = false;

    for entry in &config.sources {
        if let Some(filter) = &source {
            if &entry.name != filter {
                continue;
            }
        }
        matched = true;

        println!("{}:", entry.name);
        let connected = GitSource::connect(&entry.provider).await?;
        for repo in connected.list_repos().await? {
            if details {
                println!("  📁 {} ({})", repo.full_name, repo.url);
            } else {
                println!("  📁 {}", repo.full_name);
            }
        }
    }

    if let Some(filter) = &source {
        if !matched {
            anyhow::bail!("no source named {:?} in the configuration", filter);
        }
    }

    Ok(())
}
