//! Jobs file parsing
//!
//! ```toml
//! name = "tests"
//! mode = "dependency"
//!
//! [[job]]
//! id = "configure"
//! command = ["cmake", "-B", "build"]
//!
//! [[job]]
//! id = "build"
//! command = ["ninja", "-C", "build"]
//! timeout_secs = 1800
//! depends_on = ["configure"]
//! ```

use crate::error::{CigateError, CigateResult};
use crate::process::{GroupMode, WorkItem};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One `[[job]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A parsed jobs file
#[derive(Debug, Clone, Deserialize)]
pub struct JobsFile {
    /// Group name (defaults to the file stem)
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: Option<GroupMode>,
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobSpec>,
}

impl JobsFile {
    /// Read and validate a jobs file
    pub fn load(path: &Path) -> CigateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CigateError::io(format!("reading jobs file {}", path.display()), e))?;
        let mut file = Self::parse(&content).map_err(|e| match e {
            CigateError::TomlParse(e) => CigateError::JobsInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
            other => other,
        })?;

        if file.name.is_none() {
            file.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }

        // Relative working directories are relative to the jobs file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for job in &mut file.jobs {
            if let Some(cwd) = job.cwd.as_mut() {
                if cwd.is_relative() {
                    *cwd = base.join(&*cwd);
                }
            }
        }
        Ok(file)
    }

    /// Parse and validate jobs file contents
    pub fn parse(content: &str) -> CigateResult<Self> {
        let file: Self = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> CigateResult<()> {
        let mut ids = HashSet::new();
        for job in &self.jobs {
            if !ids.insert(job.id.as_str()) {
                return Err(CigateError::DuplicateJob(job.id.clone()));
            }
            if job.command.is_empty() {
                return Err(CigateError::EmptyCommand(job.id.clone()));
            }
        }
        for job in &self.jobs {
            if let Some(dependency) = job.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(CigateError::UnknownDependency {
                    job: job.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn group_name(&self) -> &str {
        self.name.as_deref().unwrap_or("jobs")
    }

    /// Convert to work items in file order
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.jobs
            .iter()
            .map(|job| WorkItem {
                id: job.id.clone(),
                command: job.command.clone(),
                cwd: job.cwd.clone(),
                timeout: job.timeout_secs.map(Duration::from_secs),
                depends_on: job.depends_on.clone(),
            })
            .collect()
    }
}
