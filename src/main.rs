//! cigate - Incremental CI execution
//!
//! CLI entry point that dispatches to subcommands.

use cigate::cli::{commands, Cli, Commands};
use cigate::config::{Config, ConfigManager};
use cigate::error::{CigateError, CigateResult};
use cigate::Engine;
use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Conventional exit status after SIGINT
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            if matches!(e, CigateError::Interrupted) {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run() -> CigateResult<ExitCode> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Init writes the config, so it must not require a valid one
    if let Commands::Init(args) = cli.command {
        init_logging(cli.verbose, "text");
        return commands::init(args, &manager).await.map(|()| ExitCode::SUCCESS);
    }

    let (config, sources) = load_config(&manager, cli.no_local).await?;
    init_logging(cli.verbose, &config.general.log_format);
    for source in &sources {
        debug!("Loaded config: {}", source.display());
    }

    // Ctrl-C cancels every group and lock wait started below
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running processes");
            interrupt.cancel();
        }
    });

    let engine = Engine::new(config, cancel);

    match cli.command {
        Commands::Check(args) => commands::check(args, &engine),
        Commands::Commit(args) => commands::commit(args, &engine).map(|()| ExitCode::SUCCESS),
        Commands::Invalidate(args) => {
            commands::invalidate(args, &engine).map(|()| ExitCode::SUCCESS)
        }
        Commands::Run(args) => commands::run(args, &engine)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Status => commands::status(&engine, &sources).map(|()| ExitCode::SUCCESS),
        Commands::Init(_) => unreachable!("Init handled above"),
    }
}

/// Load global config merged with the nearest local `.cigate.toml`.
///
/// Returns the files that contributed, in merge order.
async fn load_config(
    manager: &ConfigManager,
    no_local: bool,
) -> CigateResult<(Config, Vec<PathBuf>)> {
    let local = if no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| CigateError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = manager.load_merged(local.as_deref()).await?;

    let mut sources = Vec::new();
    if manager.path().exists() {
        sources.push(manager.path().to_path_buf());
    }
    sources.extend(local);
    Ok((config, sources))
}

/// Initialize logging: 0 = warn, 1 = info, 2+ = debug.
///
/// `CIGATE_LOG` takes precedence when set.
fn init_logging(verbose: u8, format: &str) {
    let default = match verbose {
        0 => "cigate=warn",
        1 => "cigate=info",
        _ => "cigate=debug",
    };
    let filter = EnvFilter::try_from_env("CIGATE_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
