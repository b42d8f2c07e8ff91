//! Per-report cleaners.
//!
//! Each report layout has its own quirks: thousands separators lost in
//! extraction, two-digit years, columns split across cells, origins spelled
//! differently from one year to the next. None of that is hard-coded in the
//! cleaning functions. Every value lives in a serde settings structure with
//! built-in defaults for the known reports, and can be replaced by a JSON
//! file without touching code.

pub mod antenne;
pub mod national;

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Read a JSON settings file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    serde_json::from_str(&text).map_err(|source| PipelineError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`load_json`], but a missing file yields `None`.
pub fn load_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    match load_json(path) {
        Ok(v) => Ok(Some(v)),
        Err(PipelineError::FileNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
