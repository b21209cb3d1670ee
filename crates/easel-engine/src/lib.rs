use std::env;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use easel_contracts::errors::JobError;
use easel_contracts::events::{EventLog, EventPayload};
use easel_contracts::jobs::action_code::{ActionCode, Mode};
use easel_contracts::jobs::last_job::LastJobPointer;
use easel_contracts::jobs::record::{ActionRecord, JobPatch, JobRecord, JobStatus, MergeMode};
use easel_contracts::jobs::store::{ActionLog, MetadataStore};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const IMAGES_METADATA_FILENAME: &str = "images_metadata.json";
pub const ACTIONS_METADATA_FILENAME: &str = "actions_metadata.json";
pub const LAST_JOB_FILENAME: &str = "last_job.json";
pub const LAST_SUCCEED_FILENAME: &str = "last_succeed.json";
pub const EVENTS_FILENAME: &str = "events.jsonl";

const DEFAULT_API_BASE: &str = "https://api.ttapi.io/midjourney/v1";

/// Callback parameters forwarded to the remote service. The service invokes
/// `hook_url` on completion; `notify_id` is an opaque correlation token the
/// caller can match the delivery against. No listener is hosted here.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookParams {
    pub hook_url: String,
    pub notify_id: String,
}

impl WebhookParams {
    pub fn new(hook_url: impl Into<String>) -> Self {
        Self {
            hook_url: hook_url.into(),
            notify_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagineRequest {
    pub prompt: String,
    pub mode: Mode,
    pub webhook: Option<WebhookParams>,
}

/// One job as the remote service reports it, with field names already
/// normalized (`jobId` → `job_id`, `cdnImage` → `url`) and the remote status
/// string mapped onto the local lifecycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteJob {
    pub job_id: String,
    pub status: Option<JobStatus>,
    pub progress: Option<u64>,
    pub prompt: Option<String>,
    pub url: Option<String>,
    pub seed: Option<i64>,
    pub components: Vec<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

impl RemoteJob {
    pub fn from_row(row: &Map<String, Value>) -> Self {
        let job_id = row
            .get("jobId")
            .or_else(|| row.get("job_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        Self {
            job_id,
            status: row
                .get("status")
                .and_then(Value::as_str)
                .and_then(map_remote_status),
            progress: row.get("progress").and_then(parse_value_to_u64),
            prompt: non_empty_string(row.get("prompt")),
            url: non_empty_string(row.get("cdnImage")).or_else(|| non_empty_string(row.get("url"))),
            seed: row.get("seed").and_then(parse_value_to_i64),
            components: row
                .get("components")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            width: row.get("width").and_then(parse_value_to_u64),
            height: row.get("height").and_then(parse_value_to_u64),
        }
    }

    /// `width`/`height`/`progress` are transient remote details and are not
    /// persisted; everything else lands on the record.
    pub fn to_patch(&self) -> JobPatch {
        JobPatch {
            prompt: self.prompt.clone(),
            url: self.url.clone(),
            seed: self.seed,
            components: self.components.clone(),
            status: self.status,
            ..JobPatch::default()
        }
    }
}

/// Seam over the remote creative-generation service so the engine can be
/// exercised against a scripted stand-in.
pub trait JobService {
    fn submit(&self, request: &ImagineRequest) -> Result<String>;
    fn fetch(&self, job_id: &str) -> Result<RemoteJob>;
    fn list(&self, page: u32, limit: u32) -> Result<Vec<RemoteJob>>;
    fn action(
        &self,
        job_id: &str,
        action: ActionCode,
        mode: Mode,
        webhook: Option<&WebhookParams>,
    ) -> Result<String>;
}

pub struct MidjourneyClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl MidjourneyClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: env::var("TTAPI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("TTAPI_API_KEY") else {
            bail!("TTAPI_API_KEY not set");
        };
        Ok(Self::new(api_key))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn post_envelope(&self, path: &str, payload: Value, context: &str) -> Result<Value> {
        let endpoint = format!("{}/{}", self.api_base, path);
        let response = self
            .http
            .post(&endpoint)
            .header("TT-API-KEY", &self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("{context} request failed ({endpoint})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(JobError::RemoteRejected(format!(
                "{context} returned HTTP {code}: {}",
                truncate_text(&body, 512)
            ))
            .into());
        }
        response
            .json()
            .with_context(|| format!("{context} response was not valid JSON"))
    }

    fn accepted_data(envelope: Value, context: &str) -> Result<Map<String, Value>> {
        let status = envelope
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !status.eq_ignore_ascii_case("SUCCESS") {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or("unknown remote error");
            return Err(JobError::RemoteRejected(format!("{context}: {message}")).into());
        }
        Ok(envelope
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }

    fn job_id_from(data: &Map<String, Value>, context: &str) -> Result<String> {
        data.get("jobId")
            .or_else(|| data.get("job_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                JobError::RemoteRejected(format!("{context}: response carried no job id")).into()
            })
    }
}

impl JobService for MidjourneyClient {
    fn submit(&self, request: &ImagineRequest) -> Result<String> {
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        payload.insert(
            "mode".to_string(),
            Value::String(request.mode.as_str().to_string()),
        );
        attach_webhook(&mut payload, request.webhook.as_ref());

        let envelope = self.post_envelope("imagine", Value::Object(payload), "imagine")?;
        let data = Self::accepted_data(envelope, "imagine")?;
        Self::job_id_from(&data, "imagine")
    }

    fn fetch(&self, job_id: &str) -> Result<RemoteJob> {
        let envelope = self.post_envelope("fetch", json!({ "jobId": job_id }), "fetch")?;
        // On /fetch the envelope status is the job's own status; a queued job
        // is not a rejection.
        let raw_status = envelope
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = envelope
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut remote = RemoteJob::from_row(&data);
        if remote.job_id.is_empty() {
            remote.job_id = job_id.to_string();
        }
        if remote.status.is_none() {
            remote.status = map_remote_status(&raw_status);
        }
        if remote.status.is_none() {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(&raw_status);
            return Err(JobError::RemoteRejected(format!(
                "fetch({job_id}): unrecognized remote status '{message}'"
            ))
            .into());
        }
        Ok(remote)
    }

    fn list(&self, page: u32, limit: u32) -> Result<Vec<RemoteJob>> {
        let envelope =
            self.post_envelope("list", json!({ "page": page, "limit": limit }), "list")?;
        let data = Self::accepted_data(envelope, "list")?;
        let rows = data
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(Value::as_object)
            .map(RemoteJob::from_row)
            .filter(|job| !job.job_id.is_empty())
            .collect())
    }

    fn action(
        &self,
        job_id: &str,
        action: ActionCode,
        mode: Mode,
        webhook: Option<&WebhookParams>,
    ) -> Result<String> {
        let mut payload = Map::new();
        payload.insert("jobId".to_string(), Value::String(job_id.to_string()));
        payload.insert(
            "action".to_string(),
            Value::String(action.as_str().to_string()),
        );
        payload.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
        attach_webhook(&mut payload, webhook);

        let envelope = self.post_envelope("action", Value::Object(payload), "action")?;
        let data = Self::accepted_data(envelope, "action")?;
        Self::job_id_from(&data, "action")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub prompt: String,
    pub concept: Option<String>,
    pub variations: Vec<String>,
    pub global_styles: Vec<String>,
    pub mode: Mode,
    pub hook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub code: ActionCode,
    pub identifier: Option<String>,
    pub use_last_succeed: bool,
    pub mode: Mode,
    pub hook_url: Option<String>,
}

impl ActionRequest {
    pub fn new(code: ActionCode) -> Self {
        Self {
            code,
            identifier: None,
            use_last_succeed: false,
            mode: Mode::default(),
            hook_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub notify_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub job_id: String,
    pub original_job_id: String,
    pub notify_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub examined: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedOutcome {
    pub job_id: String,
    pub seed: i64,
    pub fetched_remotely: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Job lifecycle engine: owns the metadata stores and pointers under one
/// data directory and drives the remote service through the `JobService`
/// seam. A store write failure never fails a command whose remote call
/// already succeeded; it is demoted to a warning (drained via
/// `take_warnings`) with a hint that `sync` can rebuild the metadata later.
pub struct JobEngine {
    data_dir: PathBuf,
    service: Box<dyn JobService>,
    events: EventLog,
    store: MetadataStore,
    actions: ActionLog,
    last_job: LastJobPointer,
    last_succeed: LastJobPointer,
    warnings: Vec<String>,
}

impl JobEngine {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        service: Box<dyn JobService>,
        command: &str,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let events = EventLog::new(data_dir.join(EVENTS_FILENAME), command);
        let mut store = MetadataStore::load(data_dir.join(IMAGES_METADATA_FILENAME));
        let mut actions = ActionLog::load(data_dir.join(ACTIONS_METADATA_FILENAME));
        let last_job = LastJobPointer::new(data_dir.join(LAST_JOB_FILENAME));
        let last_succeed = LastJobPointer::new(data_dir.join(LAST_SUCCEED_FILENAME));

        let mut warnings = Vec::new();
        for warning in [store.take_load_warning(), actions.take_load_warning()]
            .into_iter()
            .flatten()
        {
            let _ = events.emit(
                "metadata_load_warning",
                payload(json!({ "detail": warning })),
            );
            warnings.push(warning);
        }

        Ok(Self {
            data_dir,
            service,
            events,
            store,
            actions,
            last_job,
            last_succeed,
            warnings,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn actions(&self) -> &ActionLog {
        &self.actions
    }

    pub fn last_job(&self) -> &LastJobPointer {
        &self.last_job
    }

    pub fn last_succeed(&self) -> &LastJobPointer {
        &self.last_succeed
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn resolve(&self, token: &str) -> Result<&JobRecord> {
        self.store.resolve(token).map_err(anyhow::Error::new)
    }

    /// Submits a generation request; on acceptance a provisional record is
    /// stored and the last-job pointer moves to the new job.
    pub fn submit(&mut self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let webhook = request.hook_url.as_deref().map(WebhookParams::new);
        let job_id = self.service.submit(&ImagineRequest {
            prompt: request.prompt.clone(),
            mode: request.mode,
            webhook: webhook.clone(),
        })?;

        self.events.emit(
            "job_submitted",
            payload(json!({
                "job_id": job_id,
                "mode": request.mode.as_str(),
                "concept": request.concept,
                "notify_id": webhook.as_ref().map(|value| value.notify_id.clone()),
            })),
        )?;

        self.store.upsert(
            &job_id,
            JobPatch {
                prompt: Some(request.prompt),
                concept: request.concept.clone(),
                variations: request.variations,
                global_styles: request.global_styles,
                status: Some(JobStatus::Provisional),
                ..JobPatch::default()
            },
            MergeMode::Enrich,
        );
        self.persist_store();
        self.move_pointer_to(&job_id, request.concept.as_deref());

        Ok(SubmitOutcome {
            job_id,
            notify_id: webhook.map(|value| value.notify_id),
        })
    }

    /// Chains a follow-up operation onto an existing job. Without an
    /// explicit identifier the last-job pointer (or, on request, the
    /// last-success pointer) names the origin.
    pub fn submit_action(&mut self, request: ActionRequest) -> Result<ActionOutcome> {
        let origin = self.resolve_action_origin(&request)?;

        if !origin.components.is_empty()
            && !origin
                .components
                .iter()
                .any(|component| component == request.code.as_str())
        {
            self.warn(
                "component_mismatch",
                format!(
                    "job {} does not list '{}' in its known components; submitting anyway (remote service is authoritative)",
                    origin.job_id, request.code
                ),
                payload(json!({
                    "job_id": origin.job_id,
                    "action": request.code.as_str(),
                    "components": origin.components,
                })),
            );
        }

        let webhook = request.hook_url.as_deref().map(WebhookParams::new);
        let new_job_id =
            self.service
                .action(&origin.job_id, request.code, request.mode, webhook.as_ref())?;

        self.events.emit(
            "action_submitted",
            payload(json!({
                "job_id": new_job_id,
                "original_job_id": origin.job_id,
                "action": request.code.as_str(),
                "mode": request.mode.as_str(),
                "notify_id": webhook.as_ref().map(|value| value.notify_id.clone()),
            })),
        )?;

        self.actions.append(ActionRecord::new(
            origin.job_id.clone(),
            new_job_id.clone(),
            request.code.as_str(),
            request.mode.as_str(),
        ));
        self.persist_actions();

        let prompt = origin
            .prompt
            .clone()
            .unwrap_or_else(|| format!("Action: {} on {}", request.code, origin.job_id));
        let concept = origin.concept.clone().or_else(|| Some("action".to_string()));
        self.store.upsert(
            &new_job_id,
            JobPatch {
                prompt: Some(prompt),
                concept: concept.clone(),
                variations: origin.variations.clone(),
                global_styles: origin.global_styles.clone(),
                status: Some(JobStatus::Provisional),
                original_job_id: Some(origin.job_id.clone()),
                action_code: Some(request.code.as_str().to_string()),
                ..JobPatch::default()
            },
            MergeMode::Enrich,
        );
        self.persist_store();
        self.move_pointer_to(&new_job_id, concept.as_deref());

        Ok(ActionOutcome {
            job_id: new_job_id,
            original_job_id: origin.job_id,
            notify_id: webhook.map(|value| value.notify_id),
        })
    }

    /// One remote fetch, merged onto the local record (Enrich mode).
    pub fn fetch_and_record(&mut self, job_id: &str) -> Result<JobRecord> {
        let remote = self.service.fetch(job_id)?;
        self.events.emit(
            "job_fetched",
            payload(json!({
                "job_id": job_id,
                "status": remote.status.map(JobStatus::as_str),
                "progress": remote.progress,
            })),
        )?;

        let outcome = self
            .store
            .upsert(job_id, remote.to_patch(), MergeMode::Enrich);
        if outcome.mutated() {
            self.persist_store();
        }
        let record = match self.store.get(job_id) {
            Some(record) => record.clone(),
            None => bail!("job {job_id} vanished from the store after upsert"),
        };

        if record.status == JobStatus::Success {
            if let Err(err) = self.last_succeed.set(job_id, record.concept.as_deref()) {
                self.warn(
                    "pointer_write_failed",
                    format!("could not update last-success pointer: {err:#}"),
                    payload(json!({ "job_id": job_id })),
                );
            }
        }
        Ok(record)
    }

    /// Bounded busy-poll against `fetch_and_record` until the job goes
    /// terminal. On expiry the record stays `on_queue` locally and a later
    /// fetch or reconcile picks it up.
    pub fn wait(&mut self, job_id: &str, options: WaitOptions) -> Result<JobRecord> {
        let started = Instant::now();
        loop {
            let record = self.fetch_and_record(job_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if started.elapsed() >= options.timeout {
                return Err(JobError::Timeout {
                    job_id: job_id.to_string(),
                    seconds: options.timeout.as_secs(),
                }
                .into());
            }
            thread::sleep(options.interval);
        }
    }

    /// Patches the local store from the remote authoritative listing.
    /// Unknown jobs are synthesized; known jobs only gain fields they were
    /// missing. Running twice over an unchanged window changes nothing the
    /// second time.
    pub fn reconcile(&mut self, limit: u32) -> Result<ReconcileOutcome> {
        let rows = self.service.list(1, limit)?;
        let examined = rows.len();
        let mut changed = 0usize;

        for remote in rows {
            if remote.job_id.is_empty() {
                continue;
            }
            let mut patch = remote.to_patch();
            let mode = if self.store.get(&remote.job_id).is_some() {
                MergeMode::FillMissing
            } else {
                if patch.concept.is_none() {
                    patch.concept = Some("restored".to_string());
                }
                MergeMode::Enrich
            };
            if self.store.upsert(&remote.job_id, patch, mode).mutated() {
                changed += 1;
            }
        }

        if changed > 0 {
            self.persist_store();
        }
        self.events.emit(
            "reconcile_finished",
            payload(json!({ "examined": examined, "changed": changed })),
        )?;

        Ok(ReconcileOutcome { examined, changed })
    }

    /// Local seed if present, otherwise a remote fetch enriches the record
    /// first.
    pub fn get_seed(&mut self, token: &str) -> Result<SeedOutcome> {
        let (job_id, seed) = {
            let record = self.store.resolve(token).map_err(anyhow::Error::new)?;
            (record.job_id.clone(), record.seed)
        };
        if let Some(seed) = seed {
            return Ok(SeedOutcome {
                job_id,
                seed,
                fetched_remotely: false,
            });
        }

        let record = self.fetch_and_record(&job_id)?;
        let Some(seed) = record.seed else {
            bail!("job {job_id} has no seed recorded remotely yet");
        };
        Ok(SeedOutcome {
            job_id,
            seed,
            fetched_remotely: true,
        })
    }

    fn resolve_action_origin(&mut self, request: &ActionRequest) -> Result<OriginJob> {
        if let Some(token) = request
            .identifier
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            let record = self.store.resolve(token).map_err(anyhow::Error::new)?;
            return Ok(OriginJob::from_record(record));
        }

        let (pointer, label) = if request.use_last_succeed {
            (&self.last_succeed, "last successful job")
        } else {
            (&self.last_job, "last submitted job")
        };
        let Some(pointer) = pointer.get() else {
            return Err(JobError::NotFound(label.to_string()).into());
        };

        match self.store.get(&pointer.job_id) {
            Some(record) => Ok(OriginJob::from_record(record)),
            None => {
                let job_id = pointer.job_id.clone();
                self.warn(
                    "pointer_record_missing",
                    format!(
                        "job {job_id} from the {label} pointer has no local record; proceeding against the remote service"
                    ),
                    payload(json!({ "job_id": job_id })),
                );
                Ok(OriginJob {
                    job_id: pointer.job_id,
                    prompt: None,
                    concept: pointer.concept,
                    variations: Vec::new(),
                    global_styles: Vec::new(),
                    components: Vec::new(),
                })
            }
        }
    }

    fn move_pointer_to(&mut self, job_id: &str, concept: Option<&str>) {
        if let Err(err) = self.last_job.set(job_id, concept) {
            self.warn(
                "pointer_write_failed",
                format!("could not update last-job pointer: {err:#}"),
                payload(json!({ "job_id": job_id })),
            );
        }
    }

    fn persist_store(&mut self) {
        if let Err(err) = self.store.save() {
            self.warn(
                "metadata_save_failed",
                format!(
                    "metadata not saved ({err:#}); the remote operation succeeded, run 'sync' to reconcile later"
                ),
                payload(json!({ "path": self.store.path().display().to_string() })),
            );
        }
    }

    fn persist_actions(&mut self) {
        if let Err(err) = self.actions.save() {
            self.warn(
                "metadata_save_failed",
                format!(
                    "action log not saved ({err:#}); the remote operation succeeded, run 'sync' to reconcile later"
                ),
                payload(json!({ "path": self.actions.path().display().to_string() })),
            );
        }
    }

    fn warn(&mut self, event_type: &str, message: String, mut extra: EventPayload) {
        extra.insert("detail".to_string(), Value::String(message.clone()));
        let _ = self.events.emit(event_type, extra);
        self.warnings.push(message);
    }
}

struct OriginJob {
    job_id: String,
    prompt: Option<String>,
    concept: Option<String>,
    variations: Vec<String>,
    global_styles: Vec<String>,
    components: Vec<String>,
}

impl OriginJob {
    fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            prompt: record.prompt.clone(),
            concept: record.concept.clone(),
            variations: record.variations.clone(),
            global_styles: record.global_styles.clone(),
            components: record.components.clone(),
        }
    }
}

fn attach_webhook(payload: &mut Map<String, Value>, webhook: Option<&WebhookParams>) {
    if let Some(webhook) = webhook {
        payload.insert(
            "hookUrl".to_string(),
            Value::String(webhook.hook_url.clone()),
        );
        payload.insert(
            "notify_id".to_string(),
            Value::String(webhook.notify_id.clone()),
        );
    }
}

pub fn map_remote_status(raw: &str) -> Option<JobStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SUCCESS" => Some(JobStatus::Success),
        "FAILED" => Some(JobStatus::Failed),
        "ON_QUEUE" | "PENDING_QUEUE" => Some(JobStatus::OnQueue),
        _ => None,
    }
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn parse_value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use easel_contracts::errors::JobError;
    use easel_contracts::jobs::action_code::{ActionCode, Mode};
    use easel_contracts::jobs::record::JobStatus;
    use serde_json::{json, Value};

    use super::{
        map_remote_status, ActionRequest, ImagineRequest, JobEngine, JobService, RemoteJob,
        SubmitRequest, WaitOptions, WebhookParams,
    };

    #[derive(Default)]
    struct FakeService {
        submit_ids: RefCell<VecDeque<String>>,
        action_ids: RefCell<VecDeque<String>>,
        action_rejection: Option<String>,
        fetches: RefCell<HashMap<String, VecDeque<RemoteJob>>>,
        listing: Vec<RemoteJob>,
        recorded_actions: RefCell<Vec<(String, String, String)>>,
    }

    impl FakeService {
        fn queue_submit(&self, job_id: &str) {
            self.submit_ids
                .borrow_mut()
                .push_back(job_id.to_string());
        }

        fn queue_action(&self, job_id: &str) {
            self.action_ids
                .borrow_mut()
                .push_back(job_id.to_string());
        }

        fn queue_fetch(&self, job_id: &str, remote: RemoteJob) {
            self.fetches
                .borrow_mut()
                .entry(job_id.to_string())
                .or_default()
                .push_back(remote);
        }
    }

    impl JobService for FakeService {
        fn submit(&self, _request: &ImagineRequest) -> anyhow::Result<String> {
            self.submit_ids
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted submit result"))
        }

        fn fetch(&self, job_id: &str) -> anyhow::Result<RemoteJob> {
            let mut fetches = self.fetches.borrow_mut();
            let queue = fetches
                .get_mut(job_id)
                .ok_or_else(|| anyhow::anyhow!("no scripted fetch for {job_id}"))?;
            let front = queue
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted fetches for {job_id} exhausted"))?;
            if queue.is_empty() {
                // keep repeating the final scripted state
                queue.push_back(front.clone());
            }
            Ok(front)
        }

        fn list(&self, _page: u32, limit: u32) -> anyhow::Result<Vec<RemoteJob>> {
            Ok(self.listing.iter().take(limit as usize).cloned().collect())
        }

        fn action(
            &self,
            job_id: &str,
            action: ActionCode,
            mode: Mode,
            _webhook: Option<&WebhookParams>,
        ) -> anyhow::Result<String> {
            if let Some(message) = &self.action_rejection {
                return Err(JobError::RemoteRejected(message.clone()).into());
            }
            self.recorded_actions.borrow_mut().push((
                job_id.to_string(),
                action.as_str().to_string(),
                mode.as_str().to_string(),
            ));
            self.action_ids
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted action result"))
        }
    }

    fn remote(job_id: &str, status: JobStatus) -> RemoteJob {
        RemoteJob {
            job_id: job_id.to_string(),
            status: Some(status),
            ..RemoteJob::default()
        }
    }

    fn engine_with(
        temp: &tempfile::TempDir,
        service: FakeService,
        command: &str,
    ) -> JobEngine {
        JobEngine::new(temp.path().join("data"), Box::new(service), command)
            .expect("engine initializes")
    }

    #[test]
    fn submit_records_provisional_job_and_moves_pointer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        let mut engine = engine_with(&temp, service, "imagine");

        let outcome = engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            concept: Some("scientific".to_string()),
            ..SubmitRequest::default()
        })?;

        assert_eq!(outcome.job_id, "J1");
        let record = engine.store().get("J1").expect("record stored");
        assert_eq!(record.status, JobStatus::Provisional);
        assert_eq!(record.prompt.as_deref(), Some("a lighthouse at dusk"));
        assert_eq!(
            engine.last_job().get().map(|pointer| pointer.job_id),
            Some("J1".to_string())
        );
        assert!(engine.take_warnings().is_empty());
        Ok(())
    }

    #[test]
    fn action_against_last_job_pointer_records_lineage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        service.queue_action("J2");
        let mut engine = engine_with(&temp, service, "action");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            concept: Some("scientific".to_string()),
            ..SubmitRequest::default()
        })?;

        let outcome = engine.submit_action(ActionRequest {
            mode: Mode::Fast,
            ..ActionRequest::new(ActionCode::Upsample1)
        })?;

        assert_eq!(outcome.job_id, "J2");
        assert_eq!(outcome.original_job_id, "J1");

        let lineage = engine.actions().records();
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].original_job_id, "J1");
        assert_eq!(lineage[0].job_id, "J2");
        assert_eq!(lineage[0].action_code, "upsample1");
        assert_eq!(lineage[0].mode, "fast");

        let record = engine.store().get("J2").expect("provisional record");
        assert_eq!(record.status, JobStatus::Provisional);
        assert_eq!(record.original_job_id.as_deref(), Some("J1"));
        assert_eq!(record.action_code.as_deref(), Some("upsample1"));
        // prompt and concept are inherited from the origin record
        assert_eq!(record.prompt.as_deref(), Some("a lighthouse at dusk"));
        assert_eq!(record.concept.as_deref(), Some("scientific"));

        assert_eq!(
            engine.last_job().get().map(|pointer| pointer.job_id),
            Some("J2".to_string())
        );

        let raw = std::fs::read_to_string(engine.actions().path())?;
        let rows: Value = serde_json::from_str(&raw)?;
        assert_eq!(rows[0]["original_job_id"], json!("J1"));
        assert_eq!(rows[0]["job_id"], json!("J2"));
        assert_eq!(rows[0]["action_code"], json!("upsample1"));
        Ok(())
    }

    #[test]
    fn rejected_action_leaves_store_and_pointer_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService {
            action_rejection: Some("quota exhausted".to_string()),
            ..FakeService::default()
        };
        service.queue_submit("J1");
        let mut engine = engine_with(&temp, service, "action");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            ..SubmitRequest::default()
        })?;
        let before = engine.store().job_ids();

        let err = engine
            .submit_action(ActionRequest::new(ActionCode::Variation2))
            .expect_err("rejection surfaces");
        match err.downcast_ref::<JobError>() {
            Some(JobError::RemoteRejected(message)) => {
                assert!(message.contains("quota exhausted"));
            }
            other => panic!("expected RemoteRejected, got {other:?}"),
        }

        assert_eq!(engine.store().job_ids(), before);
        assert!(engine.actions().records().is_empty());
        assert_eq!(
            engine.last_job().get().map(|pointer| pointer.job_id),
            Some("J1".to_string())
        );
        Ok(())
    }

    #[test]
    fn action_without_pointer_or_identifier_is_not_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(&temp, FakeService::default(), "action");

        let err = engine
            .submit_action(ActionRequest::new(ActionCode::Reroll))
            .expect_err("nothing to act on");
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn component_mismatch_warns_but_submits() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        service.queue_action("J2");
        service.queue_fetch(
            "J1",
            RemoteJob {
                job_id: "J1".to_string(),
                status: Some(JobStatus::Success),
                components: vec!["upsample1".to_string(), "variation1".to_string()],
                ..RemoteJob::default()
            },
        );
        let mut engine = engine_with(&temp, service, "action");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            ..SubmitRequest::default()
        })?;
        engine.fetch_and_record("J1")?;
        engine.take_warnings();

        let outcome = engine.submit_action(ActionRequest {
            identifier: Some("J1".to_string()),
            ..ActionRequest::new(ActionCode::PanLeft)
        })?;
        assert_eq!(outcome.job_id, "J2");

        let warnings = engine.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("pan_left"));
        assert!(warnings[0].contains("submitting anyway"));
        Ok(())
    }

    #[test]
    fn fetch_enriches_record_and_tracks_last_success() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        service.queue_fetch(
            "J1",
            RemoteJob {
                job_id: "J1".to_string(),
                status: Some(JobStatus::Success),
                url: Some("https://cdn/img.png".to_string()),
                seed: Some(424242),
                components: vec!["upsample1".to_string()],
                ..RemoteJob::default()
            },
        );
        let mut engine = engine_with(&temp, service, "fetch");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            concept: Some("scientific".to_string()),
            ..SubmitRequest::default()
        })?;
        let record = engine.fetch_and_record("J1")?;

        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.url.as_deref(), Some("https://cdn/img.png"));
        assert_eq!(record.seed, Some(424242));
        assert_eq!(record.components, vec!["upsample1"]);
        assert!(record.metadata_updated_at.is_some());
        assert_eq!(
            engine.last_succeed().get().map(|pointer| pointer.job_id),
            Some("J1".to_string())
        );
        Ok(())
    }

    #[test]
    fn wait_times_out_and_leaves_record_on_queue() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        service.queue_fetch("J1", remote("J1", JobStatus::OnQueue));
        let mut engine = engine_with(&temp, service, "fetch");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            ..SubmitRequest::default()
        })?;

        let err = engine
            .wait(
                "J1",
                WaitOptions {
                    interval: Duration::from_millis(1),
                    timeout: Duration::from_millis(5),
                },
            )
            .expect_err("wait must time out");
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::Timeout { .. })
        ));
        assert_eq!(
            engine.store().get("J1").map(|record| record.status),
            Some(JobStatus::OnQueue)
        );
        Ok(())
    }

    #[test]
    fn reconcile_rebuilds_a_missing_store_and_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService {
            listing: vec![
                RemoteJob {
                    job_id: "J1".to_string(),
                    status: Some(JobStatus::Success),
                    prompt: Some("a lighthouse at dusk".to_string()),
                    url: Some("https://cdn/one.png".to_string()),
                    seed: Some(11),
                    components: vec!["upsample1".to_string()],
                    ..RemoteJob::default()
                },
                RemoteJob {
                    job_id: "J2".to_string(),
                    status: Some(JobStatus::OnQueue),
                    prompt: Some("a second prompt".to_string()),
                    ..RemoteJob::default()
                },
            ],
            ..FakeService::default()
        };
        let mut engine = engine_with(&temp, service, "sync");

        let first = engine.reconcile(50)?;
        assert_eq!(first.examined, 2);
        assert_eq!(first.changed, 2);

        let ids_after_first = engine.store().job_ids();
        let record = engine.store().get("J1").expect("restored record");
        assert_eq!(record.seed, Some(11));
        assert_eq!(record.url.as_deref(), Some("https://cdn/one.png"));
        assert_eq!(record.components, vec!["upsample1"]);
        assert_eq!(record.concept.as_deref(), Some("restored"));

        let second = engine.reconcile(50)?;
        assert_eq!(second.examined, 2);
        assert_eq!(second.changed, 0);
        assert_eq!(engine.store().job_ids(), ids_after_first);
        Ok(())
    }

    #[test]
    fn reconcile_fills_gaps_without_overriding_local_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService {
            listing: vec![RemoteJob {
                job_id: "J1".to_string(),
                status: Some(JobStatus::Success),
                prompt: Some("remote prompt".to_string()),
                url: Some("https://cdn/remote.png".to_string()),
                seed: Some(99),
                ..RemoteJob::default()
            }],
            ..FakeService::default()
        };
        service.queue_submit("J1");
        let mut engine = engine_with(&temp, service, "sync");

        engine.submit(SubmitRequest {
            prompt: "local prompt".to_string(),
            ..SubmitRequest::default()
        })?;

        let outcome = engine.reconcile(10)?;
        assert_eq!(outcome.changed, 1);

        let record = engine.store().get("J1").expect("record");
        // local fields win; only the gaps were filled
        assert_eq!(record.prompt.as_deref(), Some("local prompt"));
        assert_eq!(record.status, JobStatus::Provisional);
        assert_eq!(record.url.as_deref(), Some("https://cdn/remote.png"));
        assert_eq!(record.seed, Some(99));
        Ok(())
    }

    #[test]
    fn get_seed_fetches_remotely_only_when_unset() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = FakeService::default();
        service.queue_submit("J1");
        service.queue_fetch(
            "J1",
            RemoteJob {
                job_id: "J1".to_string(),
                status: Some(JobStatus::Success),
                seed: Some(777),
                ..RemoteJob::default()
            },
        );
        let mut engine = engine_with(&temp, service, "seed");

        engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            ..SubmitRequest::default()
        })?;

        let first = engine.get_seed("J1")?;
        assert_eq!(first.seed, 777);
        assert!(first.fetched_remotely);
        assert!(engine
            .store()
            .get("J1")
            .expect("record")
            .metadata_updated_at
            .is_some());

        let second = engine.get_seed("J1")?;
        assert_eq!(second.seed, 777);
        assert!(!second.fetched_remotely);
        Ok(())
    }

    #[test]
    fn failed_metadata_save_is_demoted_to_a_warning() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let data_dir = temp.path().join("data");
        // a directory squatting on the metadata path makes the rename fail
        std::fs::create_dir_all(data_dir.join(super::IMAGES_METADATA_FILENAME))?;

        let service = FakeService::default();
        service.queue_submit("J1");
        let mut engine = JobEngine::new(&data_dir, Box::new(service), "imagine")?;

        let outcome = engine.submit(SubmitRequest {
            prompt: "a lighthouse at dusk".to_string(),
            ..SubmitRequest::default()
        })?;
        assert_eq!(outcome.job_id, "J1");

        let warnings = engine.take_warnings();
        assert!(warnings.iter().any(|warning| warning.contains("not saved")));
        // the in-memory record and the pointer still advanced
        assert!(engine.store().get("J1").is_some());
        assert_eq!(
            engine.last_job().get().map(|pointer| pointer.job_id),
            Some("J1".to_string())
        );
        Ok(())
    }

    #[test]
    fn remote_rows_normalize_aliases_and_string_seeds() {
        let row = json!({
            "jobId": "J9",
            "status": "pending_queue",
            "cdnImage": "https://cdn/img.png",
            "seed": "1234567890",
            "progress": "87%",
            "components": ["upsample1", " ", "variation2"],
            "width": 2048,
            "height": 1024,
        });
        let remote = RemoteJob::from_row(row.as_object().expect("object"));
        assert_eq!(remote.job_id, "J9");
        assert_eq!(remote.status, Some(JobStatus::OnQueue));
        assert_eq!(remote.url.as_deref(), Some("https://cdn/img.png"));
        assert_eq!(remote.seed, Some(1234567890));
        assert_eq!(remote.progress, Some(87));
        assert_eq!(remote.components, vec!["upsample1", "variation2"]);
        assert_eq!(remote.width, Some(2048));

        let patch = remote.to_patch();
        assert_eq!(patch.seed, Some(1234567890));
        assert!(patch.filename.is_none());
    }

    #[test]
    fn remote_status_mapping_covers_the_service_vocabulary() {
        assert_eq!(map_remote_status("SUCCESS"), Some(JobStatus::Success));
        assert_eq!(map_remote_status("failed"), Some(JobStatus::Failed));
        assert_eq!(map_remote_status("ON_QUEUE"), Some(JobStatus::OnQueue));
        assert_eq!(map_remote_status("pending_queue"), Some(JobStatus::OnQueue));
        assert_eq!(map_remote_status("mystery"), None);
    }
}
