//! Check command - fingerprint inputs and report whether they changed

use crate::cli::args::CheckArgs;
use crate::engine::Engine;
use crate::error::CigateResult;
use std::process::ExitCode;

/// Execute the check command.
///
/// Prints `changed` or `unchanged` on stdout so scripts can capture it.
pub fn execute(args: CheckArgs, engine: &Engine) -> CigateResult<ExitCode> {
    let changed = engine.should_run(&args.cache, &args.files, args.strategy.map(Into::into))?;
    println!("{}", if changed { "changed" } else { "unchanged" });

    if args.exit_code && !changed {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
