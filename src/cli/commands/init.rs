//! Init command - write a default configuration file

use crate::cli::args::InitArgs;
use crate::config::{Config, ConfigManager, LOCAL_CONFIG_NAME};
use crate::error::{CigateError, CigateResult};
use crate::ui::{self, UiContext};

/// Execute the init command.
///
/// `manager` points at the global file (or `--config`); `--local` targets
/// the working directory instead.
pub async fn execute(args: InitArgs, manager: &ConfigManager) -> CigateResult<()> {
    let ctx = UiContext::detect();
    let target = if args.local {
        let cwd = std::env::current_dir()
            .map_err(|e| CigateError::io("getting current directory", e))?;
        ConfigManager::with_path(cwd.join(LOCAL_CONFIG_NAME))
    } else {
        ConfigManager::with_path(manager.path().to_path_buf())
    };
    let path = target.path();

    if path.exists() && !args.force {
        ui::step_warn(
            &ctx,
            &format!("Config already exists at {} (use --force to overwrite)", path.display()),
        );
        return Ok(());
    }

    target.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}
