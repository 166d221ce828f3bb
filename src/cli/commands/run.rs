//! Run command - execute a jobs file as a supervised process group

use crate::cache::CacheStrategy;
use crate::cli::args::RunArgs;
use crate::engine::Engine;
use crate::error::{CigateError, CigateResult};
use crate::jobs::JobsFile;
use crate::process::report::FailureSummary;
use crate::process::{FailureRecord, GroupMode, GroupOptions, GroupResult};
use crate::ui::{self, GroupProgress, UiContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Execute the run command
pub async fn execute(args: RunArgs, engine: &Engine) -> CigateResult<()> {
    let ctx = UiContext::detect().with_progress(engine.config().general.log_format != "json");
    let jobs = JobsFile::load(&args.jobs)?;
    let name = jobs.group_name().to_string();
    let strategy: CacheStrategy = args
        .strategy
        .map(Into::into)
        .unwrap_or(engine.config().cache.default_strategy);

    if let Some(cache) = &args.cache {
        if !engine
            .should_run_async(cache, args.inputs.clone(), Some(strategy))
            .await?
        {
            ui::step_ok_detail(
                &ctx,
                &format!("Skipped {}", name),
                &format!("inputs of cache '{}' unchanged", cache),
            );
            return Ok(());
        }
    }

    let mode = args
        .mode
        .map(GroupMode::from)
        .or(jobs.mode)
        .unwrap_or_default();
    let options = apply_overrides(engine.group_options(mode), &args);
    debug!(
        "Running group '{}' ({} mode, {} job(s))",
        name,
        mode,
        jobs.jobs.len()
    );

    let group = engine.group(&name, jobs.work_items(), options)?;
    let progress = GroupProgress::start(&ctx, &name, group.status());
    let outcome = match &args.lock {
        Some(lock) => {
            let timeout = args.lock_timeout.map(Duration::from_secs);
            engine.with_lock(lock, timeout, || group.run()).await
        }
        None => group.run().await,
    };
    progress.finish().await;

    let detail_limit = engine.config().group.failure_detail_limit;
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            if e.is_fatal() && !engine.registry().is_empty() {
                warn!(
                    "Processes still registered after '{}' stopped:\n{}",
                    name,
                    engine.registry().dump()
                );
            }
            report_failures(&ctx, e.failures(), detail_limit);
            if !matches!(e, CigateError::Interrupted | CigateError::LockTimeout { .. }) {
                record_failure(engine, &args, strategy).await;
            }
            return Err(e);
        }
    };

    print_result(&ctx, &result);
    if !result.is_success() {
        report_failures(&ctx, &result.failures, detail_limit);
        record_failure(engine, &args, strategy).await;
        let failed = result.failed();
        return Err(CigateError::GroupFailed {
            group: result.name,
            failed,
        });
    }

    if let Some(cache) = &args.cache {
        engine.commit_async(cache, Some(strategy)).await?;
    }
    Ok(())
}

/// Apply command-line overrides on top of configured group options.
///
/// A zero duration disables the corresponding limit.
fn apply_overrides(mut options: GroupOptions, args: &RunArgs) -> GroupOptions {
    let limit = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

    if let Some(threshold) = args.threshold {
        options.failure_threshold = threshold;
    }
    if let Some(secs) = args.global_timeout {
        options.global_timeout = limit(secs);
    }
    if let Some(secs) = args.stuck_threshold {
        options.stuck_threshold = limit(secs);
    }
    options
}

fn print_result(ctx: &UiContext, result: &GroupResult) {
    let elapsed = format!("{:.1}s", result.duration.as_secs_f64());
    if result.is_success() {
        ui::step_ok_detail(
            ctx,
            &format!("{}: {} job(s) passed", result.name, result.passed()),
            &elapsed,
        );
    } else {
        ui::step_error(
            ctx,
            &format!(
                "{}: {} passed, {} failed ({})",
                result.name,
                result.passed(),
                result.failed(),
                elapsed
            ),
        );
    }
}

fn report_failures(ctx: &UiContext, failures: &[FailureRecord], detail_limit: usize) {
    ui::failure_summary(ctx, &FailureSummary::new(failures, detail_limit));
}

/// Mark an aggregate cache as failed so the next run cannot skip
async fn record_failure(engine: &Engine, args: &RunArgs, strategy: CacheStrategy) {
    let Some(cache) = &args.cache else {
        return;
    };
    if strategy != CacheStrategy::Aggregate {
        return;
    }
    if let Err(e) = engine.record_failure_async(cache).await {
        warn!("Failed to record failure for cache '{}': {}", cache, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["cigate", "run", "jobs.toml"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn overrides_replace_configured_limits() {
        let base = GroupOptions {
            stuck_threshold: Some(Duration::from_secs(600)),
            ..GroupOptions::default()
        };
        let args = run_args(&["--threshold", "3", "--global-timeout", "90", "--stuck-threshold", "0"]);

        let options = apply_overrides(base, &args);
        assert_eq!(options.failure_threshold, 3);
        assert_eq!(options.global_timeout, Some(Duration::from_secs(90)));
        assert_eq!(options.stuck_threshold, None);
    }

    #[test]
    fn no_overrides_keep_config() {
        let base = GroupOptions {
            failure_threshold: 5,
            ..GroupOptions::default()
        };
        let options = apply_overrides(base, &run_args(&[]));
        assert_eq!(options.failure_threshold, 5);
        assert_eq!(options.global_timeout, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn failed_group_reports_failure_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let jobs = dir.path().join("jobs.toml");
        std::fs::write(
            &jobs,
            "[[job]]\nid = \"ok\"\ncommand = [\"true\"]\n\n\
             [[job]]\nid = \"bad\"\ncommand = [\"false\"]\n",
        )
        .unwrap();

        let mut config = crate::config::Config::default();
        config.cache.dir = dir.path().join("cache");
        let engine = Engine::new(config, tokio_util::sync::CancellationToken::new());

        let jobs = jobs.display().to_string();
        let args = match Cli::try_parse_from(["cigate", "run", jobs.as_str(), "--threshold", "5"])
            .unwrap()
            .command
        {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        };

        let err = execute(args, &engine).await.unwrap_err();
        assert!(matches!(err, CigateError::GroupFailed { failed: 1, .. }));
    }
}
