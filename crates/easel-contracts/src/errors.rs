use thiserror::Error;

/// Failure taxonomy surfaced to callers. Everything else travels as plain
/// `anyhow` context on top of one of these.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no job matches identifier '{0}'")]
    NotFound(String),

    #[error("identifier '{token}' matches {} jobs: {}", .candidates.len(), .candidates.join(", "))]
    Ambiguous {
        token: String,
        candidates: Vec<String>,
    },

    #[error("remote service rejected the request: {0}")]
    RemoteRejected(String),

    #[error("failed to persist {path}: {message}")]
    PersistenceFailure { path: String, message: String },

    #[error("timed out after {seconds}s waiting for job {job_id}")]
    Timeout { job_id: String, seconds: u64 },
}

impl JobError {
    pub fn persistence(path: impl Into<String>, message: impl ToString) -> Self {
        Self::PersistenceFailure {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobError;

    #[test]
    fn ambiguous_message_lists_candidates() {
        let err = JobError::Ambiguous {
            token: "ab00".to_string(),
            candidates: vec!["ab0001".to_string(), "ab0002".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("matches 2 jobs"));
        assert!(text.contains("ab0001"));
        assert!(text.contains("ab0002"));
    }

    #[test]
    fn not_found_message_echoes_token() {
        assert_eq!(
            JobError::NotFound("mystery".to_string()).to_string(),
            "no job matches identifier 'mystery'"
        );
    }
}
