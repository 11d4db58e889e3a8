//! Durable job scheduler
//!
//! Jobs are written through to a [`Repository`] as soon as they are created
//! and mirrored in an in-memory index keyed by job key. A single loop task
//! sleeps until the earliest fire time (or until the index changes), then
//! hands due jobs to a [`JobRunner`], each on its own task so one slow or
//! failing handler never holds up the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use dashmap::DashMap;
use hub_core::{job_key, EntityType, JobType, Schedule, ScheduleJob};
use hub_storage::Repository;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::cron::CronExpression;
use crate::error::{SchedulerError, SchedulerResult};
use crate::recurrence::Recurrence;

/// Loop wake-up interval when nothing is pending
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Length of the random suffix of non-overwriting job keys
const UNIQUE_SUFFIX_LEN: usize = 8;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Executes a fired job against its entity
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: &ScheduleJob) -> Result<(), JobError>;
}

/// Options of `runIn` and `schedule`
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Replace an existing job with the same key instead of adding another
    pub overwrite: bool,
    pub data: serde_json::Value,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    job: Arc<ScheduleJob>,
    next_fire: Option<DateTime<Utc>>,
    cron: Option<CronExpression>,
}

pub struct Scheduler {
    repository: Arc<dyn Repository<ScheduleJob>>,
    clock: Arc<dyn Clock>,
    /// Zone in which recurrences are read
    zone: FixedOffset,
    loaded: OnceCell<()>,
    index: DashMap<String, Pending>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn Repository<ScheduleJob>>,
        clock: Arc<dyn Clock>,
        zone: FixedOffset,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            repository,
            clock,
            zone,
            loaded: OnceCell::new(),
            index: DashMap::new(),
            wake: Notify::new(),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Scheduler on the system clock, reading recurrences in the local zone
    pub fn with_system_clock(repository: Arc<dyn Repository<ScheduleJob>>) -> Self {
        let zone = Local::now().offset().fix();
        Self::new(repository, Arc::new(SystemClock), zone)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn next_fire(&self, job: &ScheduleJob, cron: Option<&CronExpression>) -> Option<DateTime<Utc>> {
        match (&job.schedule, cron) {
            (_, Some(cron)) => cron
                .next_after(&self.now().with_timezone(&self.zone))
                .map(|at| at.with_timezone(&Utc)),
            (Schedule::At(millis), None) => Utc.timestamp_millis_opt(*millis).single(),
            (Schedule::Cron(_), None) => None,
        }
    }

    fn pending(&self, job: ScheduleJob) -> SchedulerResult<Pending> {
        let cron = match &job.schedule {
            Schedule::Cron(expression) => Some(CronExpression::parse(expression)?),
            Schedule::At(_) => None,
        };
        let next_fire = self.next_fire(&job, cron.as_ref());
        Ok(Pending {
            job: Arc::new(job),
            next_fire,
            cron,
        })
    }

    async fn ensure_loaded(&self) -> SchedulerResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let jobs = self.repository.list().await?;
                let count = jobs.len();
                for job in jobs {
                    let key = job.job_key.clone();
                    match self.pending(job) {
                        Ok(pending) => {
                            self.index.insert(key, pending);
                        }
                        Err(e) => warn!(job_key = %key, error = %e, "Skipping unreadable job"),
                    }
                }
                info!(count, "Schedule jobs loaded");
                Ok::<(), SchedulerError>(())
            })
            .await?;
        Ok(())
    }

    /// Load persisted jobs; overdue one-time jobs fire as soon as the loop runs
    pub async fn initialize(&self) -> SchedulerResult<usize> {
        self.ensure_loaded().await?;
        Ok(self.index.len())
    }

    async fn store(&self, pending: Pending) -> SchedulerResult<ScheduleJob> {
        let job = pending.job.as_ref().clone();
        if self.repository.get(&job.job_key).await?.is_some() {
            self.repository.update(job.clone()).await?;
        } else {
            self.repository.create(job.clone()).await?;
        }
        debug!(
            job_key = %job.job_key,
            next_fire = ?pending.next_fire,
            "Job scheduled"
        );
        self.index.insert(job.job_key.clone(), pending);
        self.wake.notify_one();
        Ok(job)
    }

    fn key(
        &self,
        job_type: JobType,
        entity_type: EntityType,
        entity_id: &str,
        handler_method: &str,
        overwrite: bool,
    ) -> String {
        let key = job_key(job_type, entity_type, entity_id, handler_method);
        if overwrite {
            return key;
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(UNIQUE_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("{}_{}", key, suffix)
    }

    /// Fire `handler_method` once after `delay`
    #[instrument(skip(self, options))]
    pub async fn run_once(
        &self,
        delay: Duration,
        entity_type: EntityType,
        entity_id: &str,
        handler_method: &str,
        options: JobOptions,
    ) -> SchedulerResult<ScheduleJob> {
        self.ensure_loaded().await?;
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| SchedulerError::InvalidSchedule(format!("delay {:?} too large", delay)))?;
        let fire = self
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| SchedulerError::InvalidSchedule(format!("delay {:?} too large", delay)))?;
        let job = ScheduleJob {
            job_key: self.key(
                JobType::RunOnce,
                entity_type,
                entity_id,
                handler_method,
                options.overwrite,
            ),
            job_type: JobType::RunOnce,
            entity_type,
            entity_id: entity_id.to_string(),
            handler_method: handler_method.to_string(),
            data: options.data,
            schedule: Schedule::At(fire.timestamp_millis()),
        };
        self.store(Pending {
            job: Arc::new(job),
            next_fire: Some(fire),
            cron: None,
        })
        .await
    }

    /// Fire `handler_method` on every occurrence of `recurrence`
    #[instrument(skip(self, options))]
    pub async fn schedule_every(
        &self,
        recurrence: &Recurrence,
        entity_type: EntityType,
        entity_id: &str,
        handler_method: &str,
        options: JobOptions,
    ) -> SchedulerResult<ScheduleJob> {
        self.ensure_loaded().await?;
        let cron = recurrence.to_cron(&self.zone)?;
        let job = ScheduleJob {
            job_key: self.key(
                JobType::RunEvery,
                entity_type,
                entity_id,
                handler_method,
                options.overwrite,
            ),
            job_type: JobType::RunEvery,
            entity_type,
            entity_id: entity_id.to_string(),
            handler_method: handler_method.to_string(),
            data: options.data,
            schedule: Schedule::Cron(cron.to_string()),
        };
        let next_fire = self.next_fire(&job, Some(&cron)).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("'{}' never fires", cron))
        })?;
        self.store(Pending {
            job: Arc::new(job),
            next_fire: Some(next_fire),
            cron: Some(cron),
        })
        .await
    }

    /// Remove the entity's jobs, or only those for one handler
    ///
    /// A handler that is already running is not interrupted.
    #[instrument(skip(self))]
    pub async fn unschedule(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        handler_method: Option<&str>,
    ) -> SchedulerResult<usize> {
        self.ensure_loaded().await?;
        let keys: Vec<String> = self
            .index
            .iter()
            .filter(|entry| {
                entry
                    .job
                    .belongs_to(entity_type, entity_id, handler_method)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.index.remove(key);
            self.repository.delete(key).await?;
        }
        if !keys.is_empty() {
            debug!(count = keys.len(), "Jobs unscheduled");
            self.wake.notify_one();
        }
        Ok(keys.len())
    }

    /// All pending jobs, ordered by key
    pub async fn jobs(&self) -> SchedulerResult<Vec<ScheduleJob>> {
        self.ensure_loaded().await?;
        let mut jobs: Vec<ScheduleJob> = self
            .index
            .iter()
            .map(|entry| entry.job.as_ref().clone())
            .collect();
        jobs.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        Ok(jobs)
    }

    pub async fn jobs_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SchedulerResult<Vec<ScheduleJob>> {
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .filter(|job| job.belongs_to(entity_type, entity_id, None))
            .collect())
    }

    /// When the job with `job_key` fires next
    pub fn next_fire_of(&self, job_key: &str) -> Option<DateTime<Utc>> {
        self.index.get(job_key).and_then(|entry| entry.next_fire)
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.index.iter().filter_map(|entry| entry.next_fire).min()
    }

    /// Take jobs due at `now`: one-time jobs leave the index and storage
    /// before they fire, recurring ones move on to their next occurrence
    async fn take_due(&self, now: DateTime<Utc>) -> Vec<Arc<ScheduleJob>> {
        let due: Vec<String> = self
            .index
            .iter()
            .filter(|entry| entry.next_fire.is_some_and(|at| at <= now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for key in due {
            let job = match self.index.get(&key) {
                Some(entry) => entry.job.clone(),
                None => continue,
            };
            match job.job_type {
                JobType::RunOnce => {
                    self.index.remove(&key);
                    if let Err(e) = self.repository.delete(&key).await {
                        error!(job_key = %key, error = %e, "Failed to delete fired job");
                    }
                }
                JobType::RunEvery => {
                    if let Some(mut entry) = self.index.get_mut(&key) {
                        let cron = entry.cron.clone();
                        entry.next_fire = self.next_fire(&job, cron.as_ref());
                    }
                }
            }
            fired.push(job);
        }
        fired
    }

    /// Start the firing loop
    pub fn start(self: &Arc<Self>, runner: Arc<dyn JobRunner>) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            warn!("Scheduler already started");
            return;
        }
        let scheduler = self.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(scheduler.run(runner, shutdown)));
        info!("Scheduler started");
    }

    async fn run(self: Arc<Self>, runner: Arc<dyn JobRunner>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.ensure_loaded().await {
            error!(error = %e, "Failed to load schedule jobs");
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = self.now();
            for job in self.take_due(now).await {
                let runner = runner.clone();
                tokio::spawn(async move {
                    debug!(job_key = %job.job_key, handler = %job.handler_method, "Firing job");
                    if let Err(e) = runner.run_job(&job).await {
                        error!(
                            job_key = %job.job_key,
                            entity_id = %job.entity_id,
                            handler = %job.handler_method,
                            error = %e,
                            "Scheduled job failed"
                        );
                    }
                });
            }

            let wait = match self.earliest() {
                Some(at) => (at - self.now()).to_std().unwrap_or(Duration::ZERO),
                None => IDLE_WAIT,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Scheduler stopped");
    }

    /// Stop the loop, wait for it and flush storage
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        self.repository.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use hub_storage::MemoryRepository;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        calls: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run_job(&self, job: &ScheduleJob) -> Result<(), JobError> {
            self.calls.lock().unwrap().push(job.handler_method.clone());
            if job.handler_method == "boom" {
                return Err("handler exploded".into());
            }
            Ok(())
        }
    }

    fn origin() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn scheduler_with(repository: Arc<MemoryRepository<ScheduleJob>>) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(
            repository,
            Arc::new(TokioClock::starting_at(origin())),
            FixedOffset::east_opt(0).unwrap(),
        ))
    }

    fn scheduler() -> Arc<Scheduler> {
        scheduler_with(Arc::new(MemoryRepository::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_in_overwrite_law() {
        let scheduler = scheduler();
        for _ in 0..2 {
            scheduler
                .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "turnOff", JobOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(scheduler.jobs().await.unwrap().len(), 1);

        let keep_both = JobOptions {
            overwrite: false,
            ..Default::default()
        };
        scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "flash", keep_both.clone())
            .await
            .unwrap();
        scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "flash", keep_both)
            .await
            .unwrap();
        let flashes = scheduler
            .jobs()
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.handler_method == "flash")
            .count();
        assert_eq!(flashes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_in_moves_fire_time() {
        let scheduler = scheduler();
        let job = scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "turnOff", JobOptions::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "turnOff", JobOptions::default())
            .await
            .unwrap();

        assert_eq!(job.job_key, "runOnce_SMARTAPP_A1_turnOff");
        assert_eq!(scheduler.jobs().await.unwrap().len(), 1);
        assert_eq!(
            scheduler.next_fire_of(&job.job_key),
            Some(origin() + chrono::Duration::seconds(70))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_fires_once_and_is_deleted() {
        let repository = Arc::new(MemoryRepository::new());
        let scheduler = scheduler_with(repository.clone());
        let recorder = Recorder::new();
        scheduler.start(recorder.clone());

        scheduler
            .run_once(Duration::from_secs(5), EntityType::Device, "D1", "off", JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(recorder.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.calls(), vec!["off"]);
        assert!(scheduler.jobs().await.unwrap().is_empty());
        assert!(repository.list().await.unwrap().is_empty());

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_job_keeps_firing() {
        let scheduler = scheduler();
        let recorder = Recorder::new();
        scheduler.start(recorder.clone());

        scheduler
            .schedule_every(
                &Recurrence::Expression("*/10 * * * * ?".into()),
                EntityType::SmartApp,
                "A1",
                "poll",
                JobOptions::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(recorder.calls().len(), 3);
        assert_eq!(scheduler.jobs().await.unwrap().len(), 1);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_does_not_stop_loop() {
        let scheduler = scheduler();
        let recorder = Recorder::new();
        scheduler.start(recorder.clone());

        scheduler
            .run_once(Duration::from_secs(1), EntityType::SmartApp, "A1", "boom", JobOptions::default())
            .await
            .unwrap();
        scheduler
            .run_once(Duration::from_secs(2), EntityType::SmartApp, "A1", "fine", JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(recorder.calls(), vec!["boom", "fine"]);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_by_entity_and_handler() {
        let scheduler = scheduler();
        let every = Recurrence::Expression("0 0 7 * * ?".into());
        scheduler
            .schedule_every(&every, EntityType::SmartApp, "A1", "morning", JobOptions::default())
            .await
            .unwrap();
        scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A1", "off", JobOptions::default())
            .await
            .unwrap();
        scheduler
            .run_once(
                Duration::from_secs(60),
                EntityType::SmartApp,
                "A1",
                "off",
                JobOptions {
                    overwrite: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        scheduler
            .run_once(Duration::from_secs(60), EntityType::SmartApp, "A10", "off", JobOptions::default())
            .await
            .unwrap();

        let removed = scheduler
            .unschedule(EntityType::SmartApp, "A1", Some("off"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(scheduler.jobs_for(EntityType::SmartApp, "A1").await.unwrap().len(), 1);

        let removed = scheduler
            .unschedule(EntityType::SmartApp, "A1", None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(scheduler.jobs_for(EntityType::SmartApp, "A10").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_jobs_fire_after_restart() {
        let overdue = ScheduleJob {
            job_key: job_key(JobType::RunOnce, EntityType::Device, "D1", "refresh"),
            job_type: JobType::RunOnce,
            entity_type: EntityType::Device,
            entity_id: "D1".into(),
            handler_method: "refresh".into(),
            data: serde_json::Value::Null,
            schedule: Schedule::At(origin().timestamp_millis() - 1_000),
        };
        let repository = Arc::new(MemoryRepository::with_records([overdue]));
        let scheduler = scheduler_with(repository.clone());
        assert_eq!(scheduler.initialize().await.unwrap(), 1);

        let recorder = Recorder::new();
        scheduler.start(recorder.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.calls(), vec!["refresh"]);
        assert!(repository.list().await.unwrap().is_empty());
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_recurrence() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule_every(
                &Recurrence::Expression("whenever".into()),
                EntityType::SmartApp,
                "A1",
                "poll",
                JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_rejects_delay_past_calendar() {
        let scheduler = scheduler();
        // Fits chrono's duration but not the calendar
        let err = scheduler
            .run_once(
                Duration::from_secs(i64::MAX as u64 / 1000 - 1),
                EntityType::SmartApp,
                "A1",
                "later",
                JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        let err = scheduler
            .run_once(Duration::MAX, EntityType::SmartApp, "A1", "later", JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(scheduler.jobs().await.unwrap().is_empty());
    }
}
