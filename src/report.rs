use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::state::{ReportState, StateError};

const SLUG_MAX_CHARS: usize = 30;

#[derive(Debug, Error)]
pub enum ReportStoreError {
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Report and checkpoint files in one output directory.
///
/// File names carry the query slug and the run's start time, so repeated
/// checkpoints of one run overwrite each other.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save_state(&self, state: &ReportState) -> Result<PathBuf, ReportStoreError> {
        let path = self.dir.join(format!("state_{}.json", file_stem(state)));
        self.write(&path, &state.to_json()?)?;
        Ok(path)
    }

    pub fn save_report(&self, state: &ReportState, markdown: &str) -> Result<PathBuf, ReportStoreError> {
        let path = self.dir.join(format!("deep_search_report_{}.md", file_stem(state)));
        self.write(&path, markdown)?;
        Ok(path)
    }

    pub fn load_state(path: &Path) -> Result<ReportState, ReportStoreError> {
        let document = fs::read_to_string(path).map_err(|source| ReportStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ReportState::from_json(&document)?)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), ReportStoreError> {
        let io_err = |source| ReportStoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        fs::write(path, contents).map_err(io_err)
    }
}

fn file_stem(state: &ReportState) -> String {
    format!("{}_{}", slug(state.query()), state.created_at().format("%Y%m%d_%H%M%S"))
}

/// Letters and digits of any script survive; everything else becomes `_`.
pub fn slug(query: &str) -> String {
    let mut out = String::new();
    for c in query.chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
        if out.chars().count() >= SLUG_MAX_CHARS {
            break;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "report".to_string()
    } else {
        trimmed.to_string()
    }
}
