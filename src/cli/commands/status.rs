//! Status command - show effective configuration and cache contents

use crate::engine::Engine;
use crate::error::{CigateError, CigateResult};
use crate::ui::{self, UiContext};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// One cache file found in the cache directory
#[derive(Debug, PartialEq, Eq)]
struct CacheEntry {
    name: String,
    pending: bool,
    committed_at: Option<String>,
}

/// Execute the status command
pub fn execute(engine: &Engine, sources: &[PathBuf]) -> CigateResult<()> {
    let ctx = UiContext::detect();
    let config = engine.config();

    ui::section(&ctx, "Configuration");
    if sources.is_empty() {
        ui::key_value(&ctx, "sources", "built-in defaults");
    }
    for source in sources {
        ui::key_value(&ctx, "source", &source.display().to_string());
    }
    let rendered = toml::to_string_pretty(config)?;
    for line in rendered.lines().filter(|l| !l.is_empty()) {
        println!("    {}", line);
    }

    ui::section(&ctx, "Caches");
    ui::key_value(&ctx, "dir", &engine.cache_dir().display().to_string());
    let entries = list_caches(engine.cache_dir())?;
    if entries.is_empty() {
        ui::step_info(&ctx, "No caches yet");
    }
    for entry in &entries {
        let committed = entry.committed_at.as_deref().unwrap_or("never");
        if entry.pending {
            ui::key_value_status(
                &ctx,
                &entry.name,
                &format!("pending commit (last committed {})", committed),
                false,
            );
        } else {
            ui::key_value_status(&ctx, &entry.name, &format!("committed {}", committed), true);
        }
    }

    ui::section(&ctx, "Locks");
    ui::key_value(&ctx, "dir", &config.lock.resolved_dir().display().to_string());
    Ok(())
}

/// Caches in `dir`, sorted by name; a missing directory has none
fn list_caches(dir: &Path) -> CigateResult<Vec<CacheEntry>> {
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CigateError::io(format!("listing {}", dir.display()), e)),
    };

    let mut names: Vec<String> = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| CigateError::io(format!("listing {}", dir.display()), e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = file_name
            .strip_suffix(".json.pending")
            .or_else(|| file_name.strip_suffix(".json"));
        if let Some(name) = name {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| {
            let committed = dir.join(format!("{}.json", name));
            let pending = dir.join(format!("{}.json.pending", name)).exists();
            let committed_at = std::fs::metadata(&committed)
                .and_then(|m| m.modified())
                .ok()
                .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string());
            CacheEntry {
                name,
                pending,
                committed_at,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lists_committed_and_pending_caches() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("lint.json"), "{}").unwrap();
        fs::write(dir.path().join("tests.json"), "{}").unwrap();
        fs::write(dir.path().join("tests.json.pending"), "{}").unwrap();
        fs::write(dir.path().join("fresh.json.pending"), "{}").unwrap();
        fs::write(dir.path().join("tests.json.lock"), "").unwrap();

        let entries = list_caches(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "lint", "tests"]);

        assert!(entries[0].pending);
        assert!(entries[0].committed_at.is_none());
        assert!(!entries[1].pending);
        assert!(entries[1].committed_at.is_some());
        assert!(entries[2].pending);
    }

    #[test]
    fn missing_dir_has_no_caches() {
        let dir = TempDir::new().unwrap();
        assert!(list_caches(&dir.path().join("absent")).unwrap().is_empty());
    }
}
