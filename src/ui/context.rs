//! UI context for detecting interactive vs CI environments

use std::io::IsTerminal;

/// CI providers that set their own marker instead of `CI`
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "TRAVIS",
    "JENKINS_URL",
    "BUILDKITE",
    "TEAMCITY_VERSION",
    "TF_BUILD",
];

/// UI context that determines output behavior
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Whether running in an interactive terminal
    interactive: bool,
    /// Whether live progress may redraw the terminal
    progress: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        let interactive = Self::detect_interactive();
        Self {
            interactive,
            progress: interactive,
        }
    }

    /// Create a non-interactive context (for testing or explicit CI mode)
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            progress: false,
        }
    }

    /// Disable live progress, e.g. when logs are structured
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled && self.interactive;
        self
    }

    /// Check if we're in an interactive terminal
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Check if we should use fancy output (symbols, colors)
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    /// Check if a progress bar may be drawn
    pub fn show_progress(&self) -> bool {
        self.progress
    }

    /// Whether the environment looks like a CI runner
    pub fn in_ci() -> bool {
        CI_VARS.iter().any(|var| std::env::var_os(var).is_some())
    }

    fn detect_interactive() -> bool {
        // Job output is interleaved with ours, so both ends must be a TTY
        if !std::io::stdout().is_terminal() || !std::io::stderr().is_terminal() {
            return false;
        }
        !Self::in_ci()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_context() {
        let ctx = UiContext::non_interactive();
        assert!(!ctx.is_interactive());
        assert!(!ctx.show_progress());
    }

    #[test]
    fn progress_requires_interactive() {
        let ctx = UiContext::non_interactive().with_progress(true);
        assert!(!ctx.show_progress());
    }
}
