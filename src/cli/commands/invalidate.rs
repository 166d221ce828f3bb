//! Invalidate command - forget committed state for a cache

use crate::cli::args::CacheArgs;
use crate::engine::Engine;
use crate::error::CigateResult;
use crate::ui::{self, UiContext};

/// Execute the invalidate command
pub fn execute(args: CacheArgs, engine: &Engine) -> CigateResult<()> {
    engine.invalidate(&args.cache, args.strategy.map(Into::into))?;
    ui::step_ok(&UiContext::detect(), &format!("Invalidated cache '{}'", args.cache));
    Ok(())
}
