//! Ranked failure summaries
//!
//! Hangs and timeouts are listed before crashes and plain exit codes since
//! they are usually the root cause of whatever failed after them. Only the
//! first few records are shown in full; the rest are counted.

use crate::process::FailureRecord;
use std::fmt;

/// Default number of records shown with their output snippet
pub const DEFAULT_DETAIL_LIMIT: usize = 3;

/// Failures ordered for display
#[derive(Debug, Clone)]
pub struct FailureSummary<'a> {
    pub detailed: Vec<&'a FailureRecord>,
    /// Records beyond the detail limit, still ranked
    pub remainder: Vec<&'a FailureRecord>,
}

impl<'a> FailureSummary<'a> {
    /// Rank `failures` and split them at `detail_limit`
    pub fn new(failures: &'a [FailureRecord], detail_limit: usize) -> Self {
        let mut ranked: Vec<&FailureRecord> = failures.iter().collect();
        // Stable sort keeps completion order within a rank.
        ranked.sort_by_key(|record| record.reason.rank());
        let remainder = ranked.split_off(detail_limit.min(ranked.len()));
        Self {
            detailed: ranked,
            remainder,
        }
    }

    pub fn total(&self) -> usize {
        self.detailed.len() + self.remainder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl fmt::Display for FailureSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} failure(s):", self.total())?;
        for record in &self.detailed {
            writeln!(
                f,
                "  {} ({}, {:.1}s): {}",
                record.id,
                record.reason,
                record.duration.as_secs_f64(),
                record.command
            )?;
            for line in &record.snippet {
                writeln!(f, "    | {}", line)?;
            }
        }
        if !self.remainder.is_empty() {
            let ids: Vec<&str> = self.remainder.iter().map(|r| r.id.as_str()).collect();
            writeln!(
                f,
                "  ... and {} more: {}",
                self.remainder.len(),
                ids.join(", ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FailureReason;
    use std::time::Duration;

    fn record(id: &str, reason: FailureReason) -> FailureRecord {
        FailureRecord {
            id: id.to_string(),
            command: format!("run {}", id),
            reason,
            snippet: vec![format!("{} output", id)],
            stack_trace: None,
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn ranks_and_truncates() {
        let failures = vec![
            record("exit1", FailureReason::NonZeroExit(1)),
            record("exit2", FailureReason::NonZeroExit(2)),
            record("segv", FailureReason::NonZeroExit(-11)),
            record("hang", FailureReason::Timeout(Duration::from_secs(60))),
            record("quiet", FailureReason::Stuck { idle: Duration::from_secs(300) }),
        ];
        let summary = FailureSummary::new(&failures, DEFAULT_DETAIL_LIMIT);

        let ids: Vec<&str> = summary.detailed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["quiet", "hang", "segv"]);
        assert_eq!(summary.remainder.len(), 2);
        assert_eq!(summary.remainder[0].id, "exit1");

        let text = summary.to_string();
        assert!(text.starts_with("5 failure(s):"));
        assert!(text.contains("| quiet output"));
        assert!(!text.contains("| exit1 output"));
        assert!(text.contains("... and 2 more: exit1, exit2"));
    }

    #[test]
    fn small_lists_show_everything() {
        let failures = vec![record("only", FailureReason::NonZeroExit(3))];
        let summary = FailureSummary::new(&failures, DEFAULT_DETAIL_LIMIT);
        assert_eq!(summary.detailed.len(), 1);
        assert!(summary.remainder.is_empty());
        assert!(!summary.to_string().contains("more"));
    }

    #[test]
    fn empty_summary() {
        let summary = FailureSummary::new(&[], 3);
        assert!(summary.is_empty());
    }
}
