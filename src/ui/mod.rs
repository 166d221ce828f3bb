//! UI module for consistent CLI output
//!
//! Styled output via `console` with plain fallbacks in CI and other
//! non-interactive environments, plus an `indicatif` live status line for
//! running groups.
//!
//! # Example
//!
//! ```rust,ignore
//! use cigate::ui::{self, GroupProgress, UiContext};
//!
//! let ctx = UiContext::detect();
//! let progress = GroupProgress::start(&ctx, "tests", group.status());
//! let result = group.run().await;
//! progress.finish().await;
//!
//! ui::step_ok(&ctx, "All jobs passed");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    failure_summary, key_value, key_value_status, section, step_error, step_info, step_ok,
    step_ok_detail, step_warn,
};
pub use progress::GroupProgress;
