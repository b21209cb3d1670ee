use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Provisional,
    OnQueue,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Provisional => "provisional",
            JobStatus::OnQueue => "on_queue",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a patch lands on an existing record.
///
/// `Enrich` is the fetch/webhook path: a set incoming field wins, an unset
/// one never blanks stored data. `FillMissing` is the reconciliation path:
/// remote data only fills gaps. In both modes `seed` is write-once and a
/// terminal `status` never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Enrich,
    FillMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_styles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    pub status: JobStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_code: Option<String>,
}

/// Incoming fields for an upsert. `None`/empty means "not supplied", which is
/// distinct from an explicit empty string in a remote payload (both are
/// ignored by the merge).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub filename: Option<String>,
    pub filepath: Option<String>,
    pub url: Option<String>,
    pub prompt: Option<String>,
    pub concept: Option<String>,
    pub variations: Vec<String>,
    pub global_styles: Vec<String>,
    pub components: Vec<String>,
    pub seed: Option<i64>,
    pub status: Option<JobStatus>,
    pub original_job_id: Option<String>,
    pub action_code: Option<String>,
}

impl JobRecord {
    pub fn from_patch(job_id: impl Into<String>, patch: JobPatch) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            filename: clean(patch.filename),
            filepath: clean(patch.filepath),
            url: clean(patch.url),
            prompt: clean(patch.prompt),
            concept: clean(patch.concept),
            variations: patch.variations,
            global_styles: patch.global_styles,
            components: patch.components,
            seed: patch.seed,
            status: patch.status.unwrap_or(JobStatus::Provisional),
            created_at: now_utc_iso(),
            metadata_updated_at: None,
            original_job_id: clean(patch.original_job_id),
            action_code: clean(patch.action_code),
        }
    }

    /// Applies `patch` under `mode` and reports whether anything changed.
    /// `id`, `job_id` and `created_at` are never touched.
    pub fn merge(&mut self, patch: &JobPatch, mode: MergeMode) -> bool {
        let overwrite = mode == MergeMode::Enrich;
        let mut changed = false;

        changed |= merge_text(&mut self.filename, &patch.filename, overwrite);
        changed |= merge_text(&mut self.filepath, &patch.filepath, overwrite);
        changed |= merge_text(&mut self.url, &patch.url, overwrite);
        changed |= merge_text(&mut self.prompt, &patch.prompt, overwrite);
        changed |= merge_text(&mut self.concept, &patch.concept, overwrite);
        changed |= merge_text(&mut self.original_job_id, &patch.original_job_id, overwrite);
        changed |= merge_text(&mut self.action_code, &patch.action_code, overwrite);
        changed |= merge_keys(&mut self.variations, &patch.variations, overwrite);
        changed |= merge_keys(&mut self.global_styles, &patch.global_styles, overwrite);
        changed |= merge_keys(&mut self.components, &patch.components, overwrite);

        // seed is write-once in every mode
        if self.seed.is_none() {
            if let Some(seed) = patch.seed {
                self.seed = Some(seed);
                changed = true;
            }
        }

        if let Some(status) = patch.status {
            if overwrite && !self.status.is_terminal() && status != self.status {
                self.status = status;
                changed = true;
            }
        }

        changed
    }

    pub fn touch(&mut self) {
        self.metadata_updated_at = Some(now_utc_iso());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub original_job_id: String,
    pub job_id: String,
    pub action_code: String,
    pub mode: String,
    pub timestamp: String,
}

impl ActionRecord {
    pub fn new(
        original_job_id: impl Into<String>,
        job_id: impl Into<String>,
        action_code: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            original_job_id: original_job_id.into(),
            job_id: job_id.into(),
            action_code: action_code.into(),
            mode: mode.into(),
            timestamp: now_utc_iso(),
        }
    }
}

fn merge_text(slot: &mut Option<String>, incoming: &Option<String>, overwrite: bool) -> bool {
    let Some(value) = incoming
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return false;
    };
    if slot.as_deref() == Some(value) {
        return false;
    }
    if slot.is_none() || overwrite {
        *slot = Some(value.to_string());
        return true;
    }
    false
}

fn merge_keys(slot: &mut Vec<String>, incoming: &[String], overwrite: bool) -> bool {
    if incoming.is_empty() || slot.as_slice() == incoming {
        return false;
    }
    if slot.is_empty() || overwrite {
        *slot = incoming.to_vec();
        return true;
    }
    false
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
