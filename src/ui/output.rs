//! Output functions for consistent CLI formatting

use super::context::UiContext;
use crate::process::report::FailureSummary;
use console::{style, Style};

/// Display a section header
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        println!("{}", style(title).cyan().bold());
    } else {
        println!("{}", style(title).bold());
    }
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("✓").green(), message);
    } else {
        println!("  {} {}", style("[OK]").green(), message);
    }
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} ({})", style("✓").green(), message, style(detail).dim());
    } else {
        println!("  {} {} ({})", style("[OK]").green(), message, detail);
    }
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("!").yellow(), message);
    } else {
        println!("  {} {}", style("[WARN]").yellow(), message);
    }
}

/// Display an error step
pub fn step_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("✗").red(), message);
    } else {
        println!("  {} {}", style("[FAIL]").red(), message);
    }
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("•").cyan(), message);
    } else {
        println!("  {} {}", style("[INFO]").cyan(), message);
    }
}

/// Print styled key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Print styled key-value with status color
pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    let value_style = if ok {
        Style::new().green()
    } else {
        Style::new().yellow()
    };

    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value_style.apply_to(value));
    } else {
        let prefix = if ok { "[OK]" } else { "[WARN]" };
        println!("  {} {}: {}", prefix, key, value);
    }
}

/// Print ranked failures: full detail for the first few, then a count
pub fn failure_summary(ctx: &UiContext, summary: &FailureSummary<'_>) {
    if summary.is_empty() {
        return;
    }
    if !ctx.use_fancy_output() {
        println!();
        print!("{}", summary);
        return;
    }

    section(ctx, &format!("{} failure(s)", summary.total()));
    for record in &summary.detailed {
        step_error(
            ctx,
            &format!(
                "{} ({}, {:.1}s)",
                style(&record.id).bold(),
                record.reason,
                record.duration.as_secs_f64()
            ),
        );
        println!("      {}", style(&record.command).dim());
        for line in &record.snippet {
            println!("      {} {}", style("|").dim(), line);
        }
        if let Some(trace) = &record.stack_trace {
            println!("      {}", style("stack trace:").yellow());
            for line in trace.lines() {
                println!("        {}", line);
            }
        }
    }

    if !summary.remainder.is_empty() {
        let ids: Vec<&str> = summary.remainder.iter().map(|r| r.id.as_str()).collect();
        step_warn(
            ctx,
            &format!("{} more failure(s): {}", summary.remainder.len(), ids.join(", ")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{FailureReason, FailureRecord};
    use std::time::Duration;

    #[test]
    fn output_non_interactive() {
        let ctx = UiContext::non_interactive();
        // These should not panic
        section(&ctx, "Test");
        step_ok(&ctx, "Step completed");
        step_warn(&ctx, "Warning");
        step_error(&ctx, "Error");
        key_value_status(&ctx, "cache", "unchanged", true);
    }

    #[test]
    fn failure_summary_non_interactive() {
        let ctx = UiContext::non_interactive();
        let failures: Vec<FailureRecord> = (0..5)
            .map(|i| FailureRecord {
                id: format!("job{}", i),
                command: "false".to_string(),
                reason: FailureReason::NonZeroExit(1),
                snippet: vec!["error: boom".to_string()],
                stack_trace: (i == 0).then(|| "#0 main ()".to_string()),
                duration: Duration::from_millis(250),
            })
            .collect();
        failure_summary(&ctx, &FailureSummary::new(&failures, 3));
    }
}
