//! CLI argument definitions using clap derive

use crate::cache::CacheStrategy;
use crate::process::GroupMode;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// cigate - Incremental CI execution
///
/// Skips work whose inputs did not change and runs the rest as supervised
/// process groups.
#[derive(Parser, Debug)]
#[command(name = "cigate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CIGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .cigate.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fingerprint files and report whether they changed
    Check(CheckArgs),

    /// Commit the fingerprint taken by the last check
    Commit(CacheArgs),

    /// Drop committed state so the next check reports a change
    Invalidate(CacheArgs),

    /// Run a jobs file as a process group
    Run(RunArgs),

    /// Show effective configuration and cache contents
    Status,

    /// Write a default configuration file
    Init(InitArgs),
}

/// Cache strategy as accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyArg {
    PerFile,
    Batch,
    Aggregate,
}

impl From<StrategyArg> for CacheStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::PerFile => Self::PerFile,
            StrategyArg::Batch => Self::Batch,
            StrategyArg::Aggregate => Self::Aggregate,
        }
    }
}

/// Group scheduling mode as accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Parallel,
    Sequential,
    Dependency,
}

impl From<ModeArg> for GroupMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Parallel => Self::Parallel,
            ModeArg::Sequential => Self::Sequential,
            ModeArg::Dependency => Self::Dependency,
        }
    }
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Cache name
    pub cache: String,

    /// Files to fingerprint
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Change detection strategy (defaults to cache.default_strategy)
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Exit with status 1 when nothing changed
    #[arg(long)]
    pub exit_code: bool,
}

/// Arguments for commands addressing one cache
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Cache name
    pub cache: String,

    /// Change detection strategy (defaults to cache.default_strategy)
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Jobs file (TOML with [[job]] tables)
    pub jobs: PathBuf,

    /// Scheduling mode (overrides the jobs file)
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Failures that abort the group
    #[arg(short, long)]
    pub threshold: Option<usize>,

    /// Hold this resource lock while the group runs
    #[arg(short, long)]
    pub lock: Option<String>,

    /// Seconds to wait for the resource lock
    #[arg(long, requires = "lock")]
    pub lock_timeout: Option<u64>,

    /// Skip the run when these inputs are unchanged for this cache
    #[arg(long, requires = "inputs")]
    pub cache: Option<String>,

    /// Input files guarded by --cache
    #[arg(long, num_args = 1.., requires = "cache")]
    pub inputs: Vec<PathBuf>,

    /// Change detection strategy for --cache
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Wall-clock limit for the whole group in seconds
    #[arg(long)]
    pub global_timeout: Option<u64>,

    /// Kill jobs silent for this many seconds
    #[arg(long)]
    pub stuck_threshold: Option<u64>,
}

/// Arguments for the init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Write .cigate.toml in the current directory instead of the global file
    #[arg(long)]
    pub local: bool,

    /// Overwrite an existing file
    #[arg(short, long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_cache() {
        let cli = Cli::try_parse_from([
            "cigate", "run", "jobs.toml", "--mode", "sequential", "--cache", "tests", "--inputs",
            "a.cpp", "b.cpp",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode, Some(ModeArg::Sequential));
        assert_eq!(args.cache.as_deref(), Some("tests"));
        assert_eq!(args.inputs.len(), 2);
    }

    #[test]
    fn cache_requires_inputs() {
        assert!(Cli::try_parse_from(["cigate", "run", "jobs.toml", "--cache", "tests"]).is_err());
    }

    #[test]
    fn strategy_values() {
        let cli = Cli::try_parse_from(["cigate", "check", "c", "f", "--strategy", "per-file"])
            .unwrap();
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(CacheStrategy::from(args.strategy.unwrap()), CacheStrategy::PerFile);
    }
}
