//! Recurring-task scheduler.
//!
//! `next_run` is computed explicitly at registration and after each run, so
//! the due check is a plain timestamp comparison at ~1s granularity. A run
//! missed while the process was down fires once on the first poll after
//! restart, then the schedule advances normally. A failing task is caught
//! and counted without halting the loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as CDuration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MarshalError, Result};
use crate::runtime::Shutdown;

// ---------------------------------------------------------------------------
// ScheduleKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    /// Fires on day-of-month equality; months without the day are skipped.
    Monthly { day: u32, hour: u32, minute: u32 },
    Interval { seconds: u64 },
}

impl ScheduleKind {
    pub fn validate(&self) -> Result<()> {
        let check_time = |hour: u32, minute: u32| {
            if hour > 23 || minute > 59 {
                Err(MarshalError::InvalidSchedule(format!(
                    "invalid time {hour:02}:{minute:02}"
                )))
            } else {
                Ok(())
            }
        };
        match self {
            Self::Daily { hour, minute } | Self::Weekly { hour, minute, .. } => {
                check_time(*hour, *minute)
            }
            Self::Monthly { day, hour, minute } => {
                if *day == 0 || *day > 31 {
                    return Err(MarshalError::InvalidSchedule(format!(
                        "invalid day of month {day}"
                    )));
                }
                check_time(*hour, *minute)
            }
            Self::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(MarshalError::InvalidSchedule(
                        "interval must be at least one second".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_run(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Interval { seconds } => after + CDuration::seconds(*seconds as i64),
            Self::Daily { hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
                let candidate = after.date_naive().and_time(time).and_utc();
                if candidate > after {
                    candidate
                } else {
                    candidate + CDuration::days(1)
                }
            }
            Self::Weekly { weekday, hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
                let mut date = after.date_naive();
                for _ in 0..8 {
                    if date.weekday() == *weekday {
                        let candidate = date.and_time(time).and_utc();
                        if candidate > after {
                            return candidate;
                        }
                    }
                    date += CDuration::days(1);
                }
                date.and_time(time).and_utc()
            }
            Self::Monthly { day, hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
                let mut date = after.date_naive();
                // 62 days covers any two consecutive months; months lacking
                // the day (e.g. 31st) are skipped by the equality guard.
                for _ in 0..63 {
                    if date.day() == *day {
                        let candidate = date.and_time(time).and_utc();
                        if candidate > after {
                            return candidate;
                        }
                    }
                    date += CDuration::days(1);
                }
                date.and_time(time).and_utc()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleEntry & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub task_id: String,
    pub kind: ScheduleKind,
    pub enabled: bool,
    pub run_count: u64,
    pub error_count: u64,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub tasks: usize,
    pub total_runs: u64,
    pub total_errors: u64,
    pub entries: Vec<ScheduleEntry>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct Job {
    entry: ScheduleEntry,
    task: TaskFn,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_task(&self, task_id: &str, kind: ScheduleKind, task: TaskFn) -> Result<()> {
        kind.validate()?;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(task_id) {
            return Err(MarshalError::TaskExists(task_id.to_string()));
        }
        let entry = ScheduleEntry {
            task_id: task_id.to_string(),
            next_run: kind.next_run(Utc::now()),
            kind,
            enabled: true,
            run_count: 0,
            error_count: 0,
            last_run: None,
            last_error: None,
        };
        info!(task_id, next_run = %entry.next_run, "task scheduled");
        jobs.insert(task_id.to_string(), Job { entry, task });
        Ok(())
    }

    pub fn unschedule_task(&self, task_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(task_id)
            .map(|_| ())
            .ok_or_else(|| MarshalError::TaskNotScheduled(task_id.to_string()))
    }

    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(task_id)
            .ok_or_else(|| MarshalError::TaskNotScheduled(task_id.to_string()))?;
        job.entry.enabled = enabled;
        Ok(())
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<ScheduleEntry> =
            jobs.values().map(|job| job.entry.clone()).collect();
        entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        SchedulerStats {
            tasks: entries.len(),
            total_runs: entries.iter().map(|e| e.run_count).sum(),
            total_errors: entries.iter().map(|e| e.error_count).sum(),
            entries,
        }
    }

    /// Run every due task once. Returns the number of tasks run.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        // Collect due work without holding the lock across awaits.
        let due: Vec<(String, TaskFn)> = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.values()
                .filter(|job| job.entry.enabled && job.entry.next_run <= now)
                .map(|job| (job.entry.task_id.clone(), Arc::clone(&job.task)))
                .collect()
        };

        for (task_id, task) in &due {
            let outcome = task().await;
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            // The task may have been unscheduled while running.
            let Some(job) = jobs.get_mut(task_id) else {
                continue;
            };
            job.entry.run_count += 1;
            job.entry.last_run = Some(now);
            job.entry.next_run = job.entry.kind.next_run(now);
            match outcome {
                Ok(()) => job.entry.last_error = None,
                Err(e) => {
                    job.entry.error_count += 1;
                    job.entry.last_error = Some(e.to_string());
                    warn!(task_id, error = %e, "scheduled task failed");
                }
            }
        }
        due.len()
    }

    /// The component loop: poll for due tasks at `granularity` (~1s).
    pub async fn run(&self, mut shutdown: Shutdown, granularity: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(granularity);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.triggered() => {
                    info!("scheduler loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
