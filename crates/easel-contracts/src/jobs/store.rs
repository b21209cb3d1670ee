use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;

use crate::errors::JobError;

use super::record::{ActionRecord, JobPatch, JobRecord, MergeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn mutated(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Insertion-ordered collection of job records backed by
/// `images_metadata.json`. Load never fails the caller: a missing or
/// unreadable file yields an empty collection plus a warning the caller can
/// surface. `save` writes the whole collection through a temporary sibling
/// file and renames it into place.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    records: IndexMap<String, JobRecord>,
    load_warning: Option<String>,
}

impl MetadataStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut records = IndexMap::new();
        let mut load_warning = None;

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(rows)) => {
                    let mut skipped = 0usize;
                    for row in rows {
                        match serde_json::from_value::<JobRecord>(row) {
                            Ok(record) => {
                                // duplicate job_id in the file: last one wins,
                                // first insertion position is kept
                                records.insert(record.job_id.clone(), record);
                            }
                            Err(_) => skipped += 1,
                        }
                    }
                    if skipped > 0 {
                        load_warning = Some(format!(
                            "{}: skipped {skipped} unreadable record(s)",
                            path.display()
                        ));
                    }
                }
                Ok(_) => {
                    load_warning = Some(format!(
                        "{}: expected a JSON array, starting with an empty collection",
                        path.display()
                    ));
                }
                Err(err) => {
                    load_warning = Some(format!(
                        "{}: unparseable metadata ({err}), starting with an empty collection",
                        path.display()
                    ));
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                load_warning = Some(format!(
                    "{}: {err}, starting with an empty collection",
                    path.display()
                ));
            }
        }

        Self {
            path,
            records,
            load_warning,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn take_load_warning(&mut self) -> Option<String> {
        self.load_warning.take()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, job_id: &str) -> Option<&JobRecord> {
        self.records.get(job_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.values()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn upsert(&mut self, job_id: &str, patch: JobPatch, mode: MergeMode) -> UpsertOutcome {
        if let Some(record) = self.records.get_mut(job_id) {
            if record.merge(&patch, mode) {
                record.touch();
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            }
        } else {
            self.records
                .insert(job_id.to_string(), JobRecord::from_patch(job_id, patch));
            UpsertOutcome::Inserted
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let rows: Vec<&JobRecord> = self.records.values().collect();
        write_json_atomic(&self.path, &serde_json::to_value(rows)?)
    }
}

/// Append-only lineage records backed by `actions_metadata.json`.
#[derive(Debug)]
pub struct ActionLog {
    path: PathBuf,
    records: Vec<ActionRecord>,
    load_warning: Option<String>,
}

impl ActionLog {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut records = Vec::new();
        let mut load_warning = None;

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<ActionRecord>>(&raw) {
                Ok(rows) => records = rows,
                Err(err) => {
                    load_warning = Some(format!(
                        "{}: unparseable action log ({err}), starting with an empty list",
                        path.display()
                    ));
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                load_warning = Some(format!(
                    "{}: {err}, starting with an empty list",
                    path.display()
                ));
            }
        }

        Self {
            path,
            records,
            load_warning,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn take_load_warning(&mut self) -> Option<String> {
        self.load_warning.take()
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn append(&mut self, record: ActionRecord) {
        self.records.push(record);
    }

    pub fn save(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.path, &serde_json::to_value(&self.records)?)
    }
}

pub(crate) fn write_json_atomic(path: &Path, payload: &Value) -> anyhow::Result<()> {
    let persistence = |err: &dyn std::fmt::Display| {
        JobError::persistence(path.display().to_string(), err.to_string())
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| persistence(&err))?;
        }
    }
    let rendered = serde_json::to_string_pretty(payload).map_err(|err| persistence(&err))?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, rendered).map_err(|err| persistence(&err))?;
    fs::rename(&tmp, path).map_err(|err| persistence(&err))?;
    Ok(())
}
