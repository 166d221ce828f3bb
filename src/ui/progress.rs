//! Live group status with CI fallback

use super::context::UiContext;
use crate::process::{GroupStatus, GroupStatusSnapshot};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REFRESH_INTERVAL: Duration = Duration::from_millis(120);

/// Progress bar that polls a group's shared status.
///
/// Interactive terminals get an indicatif bar redrawn by a background task;
/// CI gets one plain line at start and nothing until the summary.
pub struct GroupProgress {
    bar: Option<ProgressBar>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GroupProgress {
    /// Start displaying `status` for the group `label`
    pub fn start(ctx: &UiContext, label: &str, status: GroupStatus) -> Self {
        let stop = CancellationToken::new();

        if !ctx.show_progress() {
            let snapshot = status.snapshot();
            println!("Running {} ({} job(s))...", label, snapshot.total);
            return Self {
                bar: None,
                stop,
                task: None,
            };
        }

        let bar = ProgressBar::new(status.snapshot().total as u64);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("  {spinner:.cyan} {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}")
        {
            bar.set_style(
                bar_style
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .progress_chars("━╸─"),
            );
        }
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(REFRESH_INTERVAL);

        let task_bar = bar.clone();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                render(&task_bar, &status.snapshot());
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                    _ = task_stop.cancelled() => break,
                }
            }
            render(&task_bar, &status.snapshot());
        });

        Self {
            bar: Some(bar),
            stop,
            task: Some(task),
        }
    }

    /// Stop the refresh task and clear the bar
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(bar) = self.bar.take() {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

fn render(bar: &ProgressBar, snapshot: &GroupStatusSnapshot) {
    bar.set_position((snapshot.passed + snapshot.failed) as u64);
    bar.set_message(status_line(snapshot));
}

/// One-line description of what is running and how it is going
fn status_line(snapshot: &GroupStatusSnapshot) -> String {
    let mut parts = Vec::new();
    if snapshot.failed > 0 {
        parts.push(style(format!("{} failed", snapshot.failed)).red().to_string());
    }
    match snapshot.running.as_slice() {
        [] => {}
        [only] => parts.push(format!("running {}", only)),
        [first, rest @ ..] => parts.push(format!("running {} +{}", first, rest.len())),
    }
    parts.join(", ")
}
