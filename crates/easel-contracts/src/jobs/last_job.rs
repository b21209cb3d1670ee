use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::record::now_utc_iso;
use super::store::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastJob {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    pub timestamp: String,
}

/// Single mutable slot holding the most recent job id, overwritten
/// unconditionally on every successful submission. No history is kept; the
/// slot exists so a follow-up command can omit the identifier. A second
/// instance over `last_succeed.json` tracks the most recent job seen
/// reaching `success`.
#[derive(Debug, Clone)]
pub struct LastJobPointer {
    path: PathBuf,
}

impl LastJobPointer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable pointer files read as "no pointer".
    pub fn get(&self) -> Option<LastJob> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str::<LastJob>(&raw)
            .ok()
            .filter(|pointer| !pointer.job_id.trim().is_empty())
    }

    pub fn set(&self, job_id: &str, concept: Option<&str>) -> anyhow::Result<()> {
        let pointer = LastJob {
            job_id: job_id.to_string(),
            concept: concept
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            timestamp: now_utc_iso(),
        };
        write_json_atomic(&self.path, &serde_json::to_value(&pointer)?)
    }
}
