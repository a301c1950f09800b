//! Process-wide job registry: live state, progress, cooperative
//! cancellation, and a bounded execution history.

use crate::events::{EventBus, ServerEvent};
use crate::scheduler::{Scheduler, SchedulerEvent, SchedulerEventKind, TriggerKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const HISTORY_CAPACITY: usize = 100;

pub const LIBRARY_SCANNER_JOB_ID: &str = "library_scanner";
pub const DATABASE_MAINTENANCE_JOB_ID: &str = "database_maintenance";

/// Prefix of one-shot per-library scan jobs: `scan_library_{id}_{unix_seconds}`.
pub const SCAN_LIBRARY_PREFIX: &str = "scan_library_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobKind {
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "one-off")]
    OneOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub files_total: Option<u64>,
    pub files_processed: Option<u64>,
    pub current_file: Option<String>,
    pub cancellation_requested: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn new(id: &str, name: String) -> Self {
        Self {
            id: id.to_string(),
            name,
            status: JobStatus::Pending,
            last_run_time: None,
            next_run_time: None,
            running_since: None,
            error: None,
            files_total: None,
            files_processed: None,
            current_file: None,
            cancellation_requested: false,
            cancelled_at: None,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(id: &str, name: &str) -> Self {
        Self::new(id, name.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobExecutionRecord {
    pub job_id: String,
    pub job_name: String,
    pub job_type: JobKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub files_total: Option<u64>,
    pub files_processed: Option<u64>,
}

#[derive(Default)]
struct RegistryInner {
    states: HashMap<String, JobState>,
    history: VecDeque<JobExecutionRecord>,
}

/// Single source of truth for live job status. Updated from scheduler
/// callbacks and from job bodies; every mutation holds a short mutex.
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    events: EventBus,
}

impl JobRegistry {
    pub fn new(events: EventBus) -> Self {
        let mut states = HashMap::new();
        for (id, name) in [
            (LIBRARY_SCANNER_JOB_ID, "Library Scanner"),
            (DATABASE_MAINTENANCE_JOB_ID, "Database Maintenance"),
        ] {
            states.insert(id.to_string(), JobState::new(id, name.to_string()));
        }
        Self {
            inner: Mutex::new(RegistryInner {
                states,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Create-or-get the state entry for a job. `kwargs` (the job's
    /// invocation arguments) supply the library display name for
    /// `scan_library_*` ids.
    pub fn ensure(&self, job_id: &str, kwargs: Option<&serde_json::Value>) -> JobState {
        let mut inner = self.inner.lock().unwrap();
        Self::ensure_locked(&mut inner, job_id, kwargs).clone()
    }

    fn ensure_locked<'a>(
        inner: &'a mut RegistryInner,
        job_id: &str,
        kwargs: Option<&serde_json::Value>,
    ) -> &'a mut JobState {
        if !inner.states.contains_key(job_id) {
            let name = display_name_for(job_id, kwargs);
            inner
                .states
                .insert(job_id.to_string(), JobState::new(job_id, name));
        } else if job_id.starts_with(SCAN_LIBRARY_PREFIX) {
            // A later call may carry the library name the first one lacked.
            if let Some(name) = kwargs.and_then(library_name_from_kwargs) {
                let state = inner.states.get_mut(job_id).unwrap();
                state.name = format!("Library Scanner: {}", name);
            }
        }
        inner.states.get_mut(job_id).unwrap()
    }

    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.inner.lock().unwrap().states.get(job_id).cloned()
    }

    /// States for recurring jobs only, with next-run times refreshed from
    /// the scheduler. One-shot (date-trigger) jobs are excluded.
    pub fn list_scheduled(&self, scheduler: &Scheduler) -> Vec<JobState> {
        let jobs = scheduler.get_jobs();
        let mut inner = self.inner.lock().unwrap();
        let mut states = Vec::new();
        for job in jobs {
            if job.trigger_kind == TriggerKind::Date {
                continue;
            }
            let state = Self::ensure_locked(&mut inner, &job.id, Some(&job.kwargs));
            state.next_run_time = job.next_run_time;
            states.push(state.clone());
        }
        states
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        files_total: Option<u64>,
        files_processed: Option<u64>,
        current_file: Option<String>,
    ) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let Some(state) = inner.states.get_mut(job_id) else {
                return;
            };
            if files_total.is_some() {
                state.files_total = files_total;
            }
            if files_processed.is_some() {
                state.files_processed = files_processed;
            }
            if current_file.is_some() {
                state.current_file = current_file;
            }
            let snapshot = state.clone();

            if let Some(record) = latest_running_record(&mut inner.history, job_id) {
                if files_total.is_some() {
                    record.files_total = files_total;
                }
                if files_processed.is_some() {
                    record.files_processed = files_processed;
                }
            }
            snapshot
        };
        self.events.publish(ServerEvent::JobState { state: snapshot });
    }

    /// Drop the current-file marker once a pass finishes.
    pub fn clear_current_file(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.states.get_mut(job_id) {
            state.current_file = None;
        }
    }

    /// Request cooperative cancellation. Only meaningful for a running job.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.states.get_mut(job_id) else {
            return false;
        };
        if state.status != JobStatus::Running {
            return false;
        }
        state.cancellation_requested = true;
        state.cancelled_at = Some(Utc::now());
        info!("Cancellation requested for job: {}", job_id);
        true
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .states
            .get(job_id)
            .map(|s| s.cancellation_requested)
            .unwrap_or(false)
    }

    /// Mark a job cancelled after it has observed the flag and stopped.
    pub fn mark_cancelled(&self, job_id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let Some(state) = inner.states.get_mut(job_id) else {
                return;
            };
            state.status = JobStatus::Cancelled;
            state.running_since = None;
            state.cancellation_requested = false;
            let snapshot = state.clone();
            close_record(
                &mut inner.history,
                job_id,
                ExecutionStatus::Cancelled,
                Some("Job was cancelled by user".to_string()),
            );
            snapshot
        };
        info!("Job marked as cancelled: {}", job_id);
        self.events.publish(ServerEvent::JobState { state: snapshot });
    }

    /// Execution history, most recent first.
    pub fn history(&self) -> Vec<JobExecutionRecord> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().rev().cloned().collect()
    }

    /// Drop all ad-hoc state and history. Test hook.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.clear();
        inner.states.retain(|id, _| {
            id == LIBRARY_SCANNER_JOB_ID || id == DATABASE_MAINTENANCE_JOB_ID
        });
        for state in inner.states.values_mut() {
            let (id, name) = (state.id.clone(), state.name.clone());
            *state = JobState::new(&id, name);
        }
    }

    /// Scheduler listener entry point. Per-job ordering of published states
    /// follows the scheduler's submitted -> executed/error/missed ordering.
    pub fn handle_scheduler_event(&self, event: &SchedulerEvent) {
        let now = Utc::now();
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::ensure_locked(&mut inner, &event.job_id, Some(&event.kwargs));
            match &event.kind {
                SchedulerEventKind::Submitted => {
                    state.status = JobStatus::Running;
                    state.running_since = Some(now);
                    state.error = None;
                    state.files_total = None;
                    state.files_processed = None;
                    state.current_file = None;
                    state.next_run_time = event.next_run_time;
                    let record = JobExecutionRecord {
                        job_id: event.job_id.clone(),
                        job_name: state.name.clone(),
                        job_type: if event.trigger_kind == TriggerKind::Date
                            || event.job_id.starts_with(SCAN_LIBRARY_PREFIX)
                        {
                            JobKind::OneOff
                        } else {
                            JobKind::Scheduled
                        },
                        started_at: now,
                        completed_at: None,
                        duration_seconds: None,
                        status: ExecutionStatus::Running,
                        error: None,
                        files_total: None,
                        files_processed: None,
                    };
                    let snapshot = state.clone();
                    if inner.history.len() == HISTORY_CAPACITY {
                        inner.history.pop_front();
                    }
                    inner.history.push_back(record);
                    snapshot
                }
                SchedulerEventKind::Executed => {
                    // A body that cancelled itself keeps its cancelled status.
                    if state.status == JobStatus::Cancelled {
                        state.last_run_time = Some(event.scheduled_run_time);
                        state.next_run_time = event.next_run_time;
                        state.clone()
                    } else {
                        state.status = JobStatus::Success;
                        state.last_run_time = Some(event.scheduled_run_time);
                        state.running_since = None;
                        state.error = None;
                        state.next_run_time = event.next_run_time;
                        let snapshot = state.clone();
                        close_record(&mut inner.history, &event.job_id, ExecutionStatus::Completed, None);
                        snapshot
                    }
                }
                SchedulerEventKind::Error(message) => {
                    state.status = JobStatus::Failed;
                    state.last_run_time = Some(event.scheduled_run_time);
                    state.running_since = None;
                    state.error = Some(message.clone());
                    state.next_run_time = event.next_run_time;
                    let snapshot = state.clone();
                    close_record(
                        &mut inner.history,
                        &event.job_id,
                        ExecutionStatus::Failed,
                        Some(message.clone()),
                    );
                    snapshot
                }
                SchedulerEventKind::Missed => {
                    state.status = JobStatus::Failed;
                    state.last_run_time = Some(event.scheduled_run_time);
                    state.running_since = None;
                    state.error = Some("Job missed its scheduled run time".to_string());
                    state.next_run_time = event.next_run_time;
                    let snapshot = state.clone();
                    close_record(
                        &mut inner.history,
                        &event.job_id,
                        ExecutionStatus::Failed,
                        Some("Job missed its scheduled run time".to_string()),
                    );
                    snapshot
                }
            }
        };
        debug!("Job {} -> {:?}", event.job_id, snapshot.status);
        self.events.publish(ServerEvent::JobState { state: snapshot });
    }

    /// Build a listener closure for `Scheduler::add_listener`.
    pub fn listener(self: &Arc<Self>) -> crate::scheduler::Listener {
        let registry = Arc::clone(self);
        Arc::new(move |event| registry.handle_scheduler_event(&event))
    }
}

fn latest_running_record<'a>(
    history: &'a mut VecDeque<JobExecutionRecord>,
    job_id: &str,
) -> Option<&'a mut JobExecutionRecord> {
    history
        .iter_mut()
        .rev()
        .find(|r| r.job_id == job_id && r.status == ExecutionStatus::Running)
}

fn close_record(
    history: &mut VecDeque<JobExecutionRecord>,
    job_id: &str,
    status: ExecutionStatus,
    error: Option<String>,
) {
    let now = Utc::now();
    if let Some(record) = latest_running_record(history, job_id) {
        record.status = status;
        record.completed_at = Some(now);
        record.error = error;
        record.duration_seconds = Some((now - record.started_at).num_milliseconds() as f64 / 1000.0);
    }
}

fn library_name_from_kwargs(kwargs: &serde_json::Value) -> Option<String> {
    kwargs
        .get("library_name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn display_name_for(job_id: &str, kwargs: Option<&serde_json::Value>) -> String {
    if let Some(rest) = job_id.strip_prefix(SCAN_LIBRARY_PREFIX) {
        if let Some(name) = kwargs.and_then(library_name_from_kwargs) {
            return format!("Library Scanner: {}", name);
        }
        // Id shape is {library_id}_{timestamp}; fall back to the parseable id.
        if let Some(library_id) = rest.split('_').next().filter(|s| !s.is_empty()) {
            return format!("Library Scanner: {}", library_id);
        }
        return "Library Scanner".to_string();
    }

    match job_id {
        LIBRARY_SCANNER_JOB_ID => "Library Scanner".to_string(),
        DATABASE_MAINTENANCE_JOB_ID => "Database Maintenance".to_string(),
        other => {
            // "some_job_id" -> "Some Job Id"
            other
                .split('_')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

/// Build a one-shot scan job id: the library id stays parseable and the
/// timestamp keeps rapid retriggers unique.
pub fn scan_job_id(library_id: i64, now: DateTime<Utc>) -> String {
    format!("{}{}_{}", SCAN_LIBRARY_PREFIX, library_id, now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use chrono::Duration;

    fn registry() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(EventBus::new()))
    }

    fn submitted(job_id: &str) -> SchedulerEvent {
        SchedulerEvent {
            job_id: job_id.to_string(),
            kind: SchedulerEventKind::Submitted,
            scheduled_run_time: Utc::now(),
            next_run_time: None,
            trigger_kind: TriggerKind::Interval,
            kwargs: serde_json::json!({}),
        }
    }

    #[test]
    fn test_known_jobs_preregistered() {
        let registry = registry();
        assert_eq!(
            registry.get(LIBRARY_SCANNER_JOB_ID).unwrap().name,
            "Library Scanner"
        );
        assert_eq!(
            registry.get(DATABASE_MAINTENANCE_JOB_ID).unwrap().name,
            "Database Maintenance"
        );
    }

    #[test]
    fn test_scan_job_naming() {
        let registry = registry();
        let state = registry.ensure("scan_library_7_1700000000", None);
        assert_eq!(state.name, "Library Scanner: 7");

        let kwargs = serde_json::json!({"library_name": "Movies", "library_id": 7});
        let state = registry.ensure("scan_library_7_1700000000", Some(&kwargs));
        assert_eq!(state.name, "Library Scanner: Movies");
    }

    #[test]
    fn test_scan_job_id_is_parseable() {
        let now = Utc::now();
        let id = scan_job_id(42, now);
        assert!(id.starts_with("scan_library_42_"));
        let other = scan_job_id(42, now + Duration::seconds(1));
        assert_ne!(id, other);
    }

    #[test]
    fn test_unknown_job_title_cased() {
        let registry = registry();
        let state = registry.ensure("cache_warmer", None);
        assert_eq!(state.name, "Cache Warmer");
    }

    #[test]
    fn test_lifecycle_and_history() {
        let registry = registry();
        registry.handle_scheduler_event(&submitted(LIBRARY_SCANNER_JOB_ID));

        let state = registry.get(LIBRARY_SCANNER_JOB_ID).unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert!(state.running_since.is_some());

        registry.update_progress(LIBRARY_SCANNER_JOB_ID, Some(10), Some(3), Some("/m/a.mp4".into()));
        let state = registry.get(LIBRARY_SCANNER_JOB_ID).unwrap();
        assert_eq!(state.files_total, Some(10));
        assert_eq!(state.files_processed, Some(3));

        let mut done = submitted(LIBRARY_SCANNER_JOB_ID);
        done.kind = SchedulerEventKind::Executed;
        registry.handle_scheduler_event(&done);

        let state = registry.get(LIBRARY_SCANNER_JOB_ID).unwrap();
        assert_eq!(state.status, JobStatus::Success);
        assert!(state.running_since.is_none());

        let history = registry.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Completed);
        assert_eq!(history[0].files_processed, Some(3));
        assert!(history[0].duration_seconds.is_some());
    }

    #[test]
    fn test_cancellation_flow() {
        let registry = registry();

        // Not running yet: request is rejected.
        assert!(!registry.request_cancel(LIBRARY_SCANNER_JOB_ID));

        registry.handle_scheduler_event(&submitted(LIBRARY_SCANNER_JOB_ID));
        assert!(registry.request_cancel(LIBRARY_SCANNER_JOB_ID));
        assert!(registry.is_cancel_requested(LIBRARY_SCANNER_JOB_ID));

        registry.mark_cancelled(LIBRARY_SCANNER_JOB_ID);
        let state = registry.get(LIBRARY_SCANNER_JOB_ID).unwrap();
        assert_eq!(state.status, JobStatus::Cancelled);
        assert!(!state.cancellation_requested);

        // Second cancel on a terminal job is a no-op rejection.
        assert!(!registry.request_cancel(LIBRARY_SCANNER_JOB_ID));

        let history = registry.history();
        assert_eq!(history[0].status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_error_event_records_failure() {
        let registry = registry();
        registry.handle_scheduler_event(&submitted(DATABASE_MAINTENANCE_JOB_ID));

        let mut failed = submitted(DATABASE_MAINTENANCE_JOB_ID);
        failed.kind = SchedulerEventKind::Error("disk on fire".to_string());
        registry.handle_scheduler_event(&failed);

        let state = registry.get(DATABASE_MAINTENANCE_JOB_ID).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("disk on fire"));
        assert_eq!(registry.history()[0].status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let registry = registry();
        for i in 0..(HISTORY_CAPACITY + 20) {
            let id = format!("scan_library_1_{}", i);
            registry.handle_scheduler_event(&submitted(&id));
            let mut done = submitted(&id);
            done.kind = SchedulerEventKind::Executed;
            registry.handle_scheduler_event(&done);
        }
        let history = registry.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // Most recent first.
        assert_eq!(
            history[0].job_id,
            format!("scan_library_1_{}", HISTORY_CAPACITY + 19)
        );
    }

    #[test]
    fn test_one_off_detection() {
        let registry = registry();
        registry.handle_scheduler_event(&submitted("scan_library_3_1700000000"));
        assert_eq!(registry.history()[0].job_type, JobKind::OneOff);

        registry.handle_scheduler_event(&submitted(LIBRARY_SCANNER_JOB_ID));
        assert_eq!(registry.history()[0].job_type, JobKind::Scheduled);
    }

    #[test]
    fn test_list_scheduled_excludes_one_shot_jobs() {
        let registry = registry();
        let scheduler = Scheduler::new();
        let noop: crate::scheduler::JobFn = Arc::new(|_ctx| Box::pin(async { Ok(()) }));

        scheduler
            .add_job(crate::scheduler::JobSpec {
                id: LIBRARY_SCANNER_JOB_ID.to_string(),
                trigger: crate::scheduler::Trigger::Interval(std::time::Duration::from_secs(7200)),
                kwargs: serde_json::json!({}),
                func: Arc::clone(&noop),
                replace_existing: true,
            })
            .unwrap();
        scheduler
            .add_job(crate::scheduler::JobSpec {
                id: "scan_library_9_1700000000".to_string(),
                trigger: crate::scheduler::Trigger::Date(Utc::now() + Duration::hours(1)),
                kwargs: serde_json::json!({"library_name": "Movies"}),
                func: noop,
                replace_existing: true,
            })
            .unwrap();

        let states = registry.list_scheduled(&scheduler);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, LIBRARY_SCANNER_JOB_ID);
        assert!(states[0].next_run_time.is_some());
    }

    #[test]
    fn test_reset_keeps_known_jobs() {
        let registry = registry();
        registry.ensure("scan_library_1_1", None);
        registry.handle_scheduler_event(&submitted(LIBRARY_SCANNER_JOB_ID));
        registry.reset();
        assert!(registry.history().is_empty());
        assert!(registry.get("scan_library_1_1").is_none());
        let state = registry.get(LIBRARY_SCANNER_JOB_ID).unwrap();
        assert_eq!(state.status, JobStatus::Pending);
    }
}
