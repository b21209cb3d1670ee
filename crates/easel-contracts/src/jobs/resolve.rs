use crate::errors::JobError;

use super::record::JobRecord;
use super::store::MetadataStore;

impl MetadataStore {
    /// Maps a user-supplied token to a record. Matching is case-insensitive
    /// and ignores a trailing image extension on either side. Order: exact
    /// job id, exact filename, then unique job-id prefix. Two or more prefix
    /// hits fail loudly instead of guessing the most recent one.
    pub fn resolve(&self, token: &str) -> Result<&JobRecord, JobError> {
        let needle = strip_extension_lower(token.trim());
        if needle.is_empty() {
            return Err(JobError::NotFound(token.to_string()));
        }

        if let Some(record) = self
            .records()
            .find(|record| record.job_id.to_ascii_lowercase() == needle)
        {
            return Ok(record);
        }

        if let Some(record) = self.records().find(|record| {
            record
                .filename
                .as_deref()
                .map(|name| strip_extension_lower(name) == needle)
                .unwrap_or(false)
        }) {
            return Ok(record);
        }

        let matches: Vec<&JobRecord> = self
            .records()
            .filter(|record| record.job_id.to_ascii_lowercase().starts_with(&needle))
            .collect();
        match matches.as_slice() {
            [record] => Ok(record),
            [] => Err(JobError::NotFound(token.trim().to_string())),
            _ => Err(JobError::Ambiguous {
                token: token.trim().to_string(),
                candidates: matches
                    .iter()
                    .map(|record| record.job_id.clone())
                    .collect(),
            }),
        }
    }
}

fn strip_extension_lower(value: &str) -> String {
    let lowered = value.to_ascii_lowercase();
    for ext in [".png", ".jpg", ".jpeg", ".webp"] {
        if let Some(stripped) = lowered.strip_suffix(ext) {
            return stripped.to_string();
        }
    }
    lowered
}
