//! Time-driven job dispatcher with interval, cron, and one-shot triggers.
//!
//! Listeners receive submitted/executed/error/missed events; the job
//! registry is attached as one and nothing else inspects scheduler state.

use crate::error::{LumiereError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// A run later than this past its scheduled time is reported missed.
const MISFIRE_GRACE_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Interval,
    Cron,
    Date,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(std::time::Duration),
    /// Daily at hour:minute (UTC).
    Cron { hour: u32, minute: u32 },
    /// One-shot at the given instant.
    Date(DateTime<Utc>),
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Interval(_) => TriggerKind::Interval,
            Trigger::Cron { .. } => TriggerKind::Cron,
            Trigger::Date(_) => TriggerKind::Date,
        }
    }

    /// Next fire time strictly after `after`. One-shot triggers return their
    /// instant even when it is already past; the driver removes them after
    /// they fire.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(period) => {
                let period = ChronoDuration::from_std(*period).ok()?;
                Some(after + period)
            }
            Trigger::Cron { hour, minute } => {
                let today = Utc
                    .with_ymd_and_hms(after.year(), after.month(), after.day(), *hour, *minute, 0)
                    .single()?;
                if today > after {
                    Some(today)
                } else {
                    Some(today + ChronoDuration::days(1))
                }
            }
            Trigger::Date(at) => Some(*at),
        }
    }
}

#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub kwargs: serde_json::Value,
}

pub type JobFn =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static>;

pub struct JobSpec {
    pub id: String,
    pub trigger: Trigger,
    pub kwargs: serde_json::Value,
    pub func: JobFn,
    pub replace_existing: bool,
}

struct ScheduledJob {
    id: String,
    trigger: Trigger,
    kwargs: serde_json::Value,
    func: JobFn,
    next_run_time: Option<DateTime<Utc>>,
}

/// Read-only snapshot of a scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub trigger_kind: TriggerKind,
    pub next_run_time: Option<DateTime<Utc>>,
    pub kwargs: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum SchedulerEventKind {
    Submitted,
    Executed,
    Error(String),
    Missed,
}

#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub job_id: String,
    pub kind: SchedulerEventKind,
    pub scheduled_run_time: DateTime<Utc>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger_kind: TriggerKind,
    pub kwargs: serde_json::Value,
}

pub type Listener = Arc<dyn Fn(SchedulerEvent) + Send + Sync + 'static>;

struct SchedulerInner {
    jobs: HashMap<String, ScheduledJob>,
    listeners: Vec<Listener>,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    wakeup: Notify,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                jobs: HashMap::new(),
                listeners: Vec::new(),
            }),
            wakeup: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Listener) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    pub fn add_job(&self, spec: JobSpec) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.contains_key(&spec.id) && !spec.replace_existing {
            return Err(LumiereError::Conflict(format!(
                "Job already scheduled: {}",
                spec.id
            )));
        }
        let next_run_time = spec.trigger.next_fire(now);
        inner.jobs.insert(
            spec.id.clone(),
            ScheduledJob {
                id: spec.id,
                trigger: spec.trigger,
                kwargs: spec.kwargs,
                func: spec.func,
                next_run_time,
            },
        );
        drop(inner);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Move a job's next run time; used to trigger a job immediately.
    pub fn modify_job(&self, job_id: &str, next_run_time: DateTime<Utc>) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(LumiereError::Unavailable("Scheduler not started".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| LumiereError::NotFound(format!("Job {}", job_id)))?;
        job.next_run_time = Some(next_run_time);
        drop(inner);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(job_id).map(job_info)
    }

    pub fn get_jobs(&self) -> Vec<JobInfo> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<JobInfo> = inner.jobs.values().map(job_info).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn remove_job(&self, job_id: &str) -> bool {
        let removed = self.inner.lock().unwrap().jobs.remove(job_id).is_some();
        if removed {
            self.wakeup.notify_one();
        }
        removed
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start the driver task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_driver().await;
        });
        info!("Scheduler started");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.wakeup.notify_one();
        info!("Scheduler shut down");
    }

    async fn run_driver(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let now = Utc::now();
            let due = self.collect_due(now);
            for job in due {
                self.dispatch(job, now);
            }

            let sleep_for = self.time_until_next(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Pop due jobs and advance their schedules. One-shot jobs are removed
    /// once claimed.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut inner = self.inner.lock().unwrap();
        let listeners = inner.listeners.clone();
        let mut due = Vec::new();
        let mut finished_one_shots = Vec::new();

        for job in inner.jobs.values_mut() {
            let Some(scheduled) = job.next_run_time else {
                continue;
            };
            if scheduled > now {
                continue;
            }

            let next_run_time = match job.trigger.kind() {
                TriggerKind::Date => None,
                _ => job.trigger.next_fire(now),
            };
            job.next_run_time = next_run_time;
            if job.trigger.kind() == TriggerKind::Date {
                finished_one_shots.push(job.id.clone());
            }

            due.push(DueJob {
                id: job.id.clone(),
                scheduled,
                next_run_time,
                trigger_kind: job.trigger.kind(),
                kwargs: job.kwargs.clone(),
                func: Arc::clone(&job.func),
                listeners: listeners.clone(),
            });
        }

        for id in finished_one_shots {
            inner.jobs.remove(&id);
        }

        due
    }

    fn dispatch(&self, job: DueJob, now: DateTime<Utc>) {
        if (now - job.scheduled).num_seconds() > MISFIRE_GRACE_SECONDS {
            warn!(
                "Job {} missed its run time ({})",
                job.id, job.scheduled
            );
            job.emit(SchedulerEventKind::Missed);
            return;
        }

        job.emit(SchedulerEventKind::Submitted);

        let context = JobContext {
            job_id: job.id.clone(),
            kwargs: job.kwargs.clone(),
        };
        let func = Arc::clone(&job.func);
        tokio::spawn(async move {
            match func(context).await {
                Ok(()) => job.emit(SchedulerEventKind::Executed),
                Err(e) => {
                    error!("Job {} failed: {}", job.id, e);
                    job.emit(SchedulerEventKind::Error(e.to_string()));
                }
            }
        });
    }

    fn time_until_next(&self, now: DateTime<Utc>) -> std::time::Duration {
        let inner = self.inner.lock().unwrap();
        let next = inner
            .jobs
            .values()
            .filter_map(|j| j.next_run_time)
            .min();
        match next {
            Some(at) if at > now => (at - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1)),
            Some(_) => std::time::Duration::from_millis(0),
            // Nothing scheduled; sleep until woken.
            None => std::time::Duration::from_secs(3600),
        }
    }
}

struct DueJob {
    id: String,
    scheduled: DateTime<Utc>,
    next_run_time: Option<DateTime<Utc>>,
    trigger_kind: TriggerKind,
    kwargs: serde_json::Value,
    func: JobFn,
    listeners: Vec<Listener>,
}

impl DueJob {
    fn emit(&self, kind: SchedulerEventKind) {
        let event = SchedulerEvent {
            job_id: self.id.clone(),
            kind,
            scheduled_run_time: self.scheduled,
            next_run_time: self.next_run_time,
            trigger_kind: self.trigger_kind,
            kwargs: self.kwargs.clone(),
        };
        for listener in &self.listeners {
            listener(event.clone());
        }
    }
}

fn job_info(job: &ScheduledJob) -> JobInfo {
    JobInfo {
        id: job.id.clone(),
        trigger_kind: job.trigger.kind(),
        next_run_time: job.next_run_time,
        kwargs: job.kwargs.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn noop_job() -> JobFn {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_interval_next_fire() {
        let trigger = Trigger::Interval(Duration::from_secs(120));
        let now = Utc::now();
        let next = trigger.next_fire(now).unwrap();
        assert_eq!((next - now).num_seconds(), 120);
    }

    #[test]
    fn test_cron_next_fire_rolls_to_next_day() {
        let trigger = Trigger::Cron { hour: 3, minute: 0 };
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();
        let next = trigger.next_fire(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap());

        let before = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        let next = trigger.next_fire(before).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_add_job_conflict() {
        let scheduler = Scheduler::new();
        let spec = |replace| JobSpec {
            id: "job".into(),
            trigger: Trigger::Interval(Duration::from_secs(60)),
            kwargs: serde_json::json!({}),
            func: noop_job(),
            replace_existing: replace,
        };
        scheduler.add_job(spec(false)).unwrap();
        assert!(matches!(
            scheduler.add_job(spec(false)),
            Err(LumiereError::Conflict(_))
        ));
        scheduler.add_job(spec(true)).unwrap();
        assert_eq!(scheduler.get_jobs().len(), 1);
    }

    #[test]
    fn test_modify_before_start_is_unavailable() {
        let scheduler = Scheduler::new();
        scheduler
            .add_job(JobSpec {
                id: "job".into(),
                trigger: Trigger::Interval(Duration::from_secs(60)),
                kwargs: serde_json::json!({}),
                func: noop_job(),
                replace_existing: true,
            })
            .unwrap();
        assert!(matches!(
            scheduler.modify_job("job", Utc::now()),
            Err(LumiereError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_date_job_fires_once_with_ordered_events() {
        let scheduler = Arc::new(Scheduler::new());
        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let seen = Arc::clone(&events);
        scheduler.add_listener(Arc::new(move |event| {
            let label = match event.kind {
                SchedulerEventKind::Submitted => "submitted",
                SchedulerEventKind::Executed => "executed",
                SchedulerEventKind::Error(_) => "error",
                SchedulerEventKind::Missed => "missed",
            };
            seen.lock().unwrap().push(format!("{}:{}", event.job_id, label));
        }));

        scheduler
            .add_job(JobSpec {
                id: "one_shot".into(),
                trigger: Trigger::Date(Utc::now()),
                kwargs: serde_json::json!({"library_id": 1}),
                func: noop_job(),
                replace_existing: true,
            })
            .unwrap();
        scheduler.start();

        // Wait for both events with a generous deadline.
        for _ in 0..100 {
            if events.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec!["one_shot:submitted", "one_shot:executed"]);
        // One-shot jobs disappear from the listing after firing.
        assert!(scheduler.get_job("one_shot").is_none());
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_failing_job_emits_error() {
        let scheduler = Arc::new(Scheduler::new());
        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let seen = Arc::clone(&events);
        scheduler.add_listener(Arc::new(move |event| {
            if let SchedulerEventKind::Error(message) = &event.kind {
                seen.lock().unwrap().push(message.clone());
            }
        }));

        scheduler
            .add_job(JobSpec {
                id: "broken".into(),
                trigger: Trigger::Date(Utc::now()),
                kwargs: serde_json::json!({}),
                func: Arc::new(|_ctx| {
                    Box::pin(async { Err(LumiereError::Internal("boom".into())) })
                }),
                replace_existing: true,
            })
            .unwrap();
        scheduler.start();

        for _ in 0..100 {
            if !events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("boom"));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_stale_date_job_is_missed() {
        let scheduler = Arc::new(Scheduler::new());
        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let seen = Arc::clone(&events);
        scheduler.add_listener(Arc::new(move |event| {
            if matches!(event.kind, SchedulerEventKind::Missed) {
                seen.lock().unwrap().push(event.job_id.clone());
            }
        }));

        scheduler
            .add_job(JobSpec {
                id: "stale".into(),
                trigger: Trigger::Date(Utc::now() - ChronoDuration::seconds(MISFIRE_GRACE_SECONDS + 10)),
                kwargs: serde_json::json!({}),
                func: noop_job(),
                replace_existing: true,
            })
            .unwrap();
        scheduler.start();

        for _ in 0..100 {
            if !events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(events.lock().unwrap().as_slice(), ["stale"]);
        scheduler.shutdown();
    }
}
