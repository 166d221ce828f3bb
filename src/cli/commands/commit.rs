//! Commit command - promote the fingerprint taken by the last check

use crate::cli::args::CacheArgs;
use crate::engine::Engine;
use crate::error::CigateResult;
use crate::ui::{self, UiContext};

/// Execute the commit command
pub fn execute(args: CacheArgs, engine: &Engine) -> CigateResult<()> {
    engine.commit(&args.cache, args.strategy.map(Into::into))?;
    ui::step_ok(&UiContext::detect(), &format!("Committed cache '{}'", args.cache));
    Ok(())
}
