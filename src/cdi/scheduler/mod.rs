/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Background task scheduling: one-shot, delayed and cron-driven jobs with
//! cooperative cancellation. Controllers use it for watch loops and for the
//! DataImportCron tick.

use crate::cdi::logger::log_error;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "scheduler";

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone)]
pub struct ScheduleContext {
    task_id: TaskId,
    label: &'static str,
    cancellation: CancellationToken,
    scheduled_for: Option<DateTime<Utc>>,
}

impl ScheduleContext {
    fn new(
        task_id: TaskId,
        label: &'static str,
        cancellation: CancellationToken,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        ScheduleContext {
            task_id,
            label,
            cancellation,
            scheduled_for,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    next_id: AtomicU64,
}

#[derive(Clone, Debug)]
pub enum ScheduleSpec {
    Immediate {
        label: &'static str,
    },
    After {
        label: &'static str,
        delay: Duration,
    },
    Cron {
        label: &'static str,
        schedule: Box<CronSchedule>,
    },
}

type JobFn = dyn Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static;

pub struct ScheduledTaskHandle {
    cancellation: CancellationToken,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronParseError(String);

impl std::fmt::Display for CronParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid cron expression: {}", self.0)
    }
}

impl std::error::Error for CronParseError {}

#[derive(Clone)]
pub struct CronSchedule {
    expression: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn new(expression: Schedule, timezone: Tz) -> Self {
        Self {
            expression,
            timezone,
        }
    }

    /// Parses a seconds-first expression as understood by the `cron` crate.
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self, CronParseError> {
        Schedule::from_str(expression)
            .map(|schedule| Self::new(schedule, timezone))
            .map_err(|err| CronParseError(format!("{expression}: {err}")))
    }

    /// Parses a standard five-field expression evaluated in UTC.
    pub fn from_standard(expression: &str) -> Result<Self, CronParseError> {
        let translated = translate_standard(expression)?;
        Self::parse(&translated, chrono_tz::UTC)
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz_after = self.timezone.from_utc_datetime(&after.naive_utc());
        self.expression
            .after(&tz_after)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression.to_string())
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// Rewrites `m h dom mon dow` into `s m h dom mon dow`. Day-of-week digits
/// move from Sunday=0 to the crate's Sunday=1 numbering; step values after
/// `/` are left alone.
fn translate_standard(expression: &str) -> Result<String, CronParseError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronParseError(format!(
            "{expression}: expected 5 fields, found {}",
            fields.len()
        )));
    }
    let mut day_of_week = String::with_capacity(fields[4].len());
    let mut after_slash = false;
    for ch in fields[4].chars() {
        match ch.to_digit(10) {
            Some(digit) if !after_slash => {
                let mapped = char::from_digit((digit % 7) + 1, 10).unwrap_or(ch);
                day_of_week.push(mapped);
            }
            _ => {
                if ch == '/' {
                    after_slash = true;
                } else if !ch.is_ascii_digit() {
                    after_slash = false;
                }
                day_of_week.push(ch);
            }
        }
    }
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

impl Scheduler {
    pub fn global() -> Scheduler {
        static INSTANCE: OnceLock<Scheduler> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Scheduler {
                inner: Arc::new(SchedulerInner {
                    next_id: AtomicU64::new(1),
                }),
            })
            .clone()
    }

    pub fn schedule<F>(&self, spec: ScheduleSpec, job: F) -> ScheduledTaskHandle
    where
        F: Fn(ScheduleContext) -> JobFuture + Send + Sync + 'static,
    {
        let job = Arc::new(job) as Arc<JobFn>;
        let task_id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancellation = CancellationToken::new();
        let join_handle = self.spawn_for_spec(task_id, &cancellation, spec, job);
        ScheduledTaskHandle {
            cancellation,
            join: Arc::new(Mutex::new(Some(join_handle))),
        }
    }

    fn spawn_for_spec(
        &self,
        task_id: TaskId,
        cancellation: &CancellationToken,
        spec: ScheduleSpec,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let cancellation = cancellation.clone();

        match spec {
            ScheduleSpec::Immediate { label } => {
                let ctx = ScheduleContext::new(task_id, label, cancellation, None);
                tokio::spawn(async move {
                    scheduler.run_job(job, ctx).await;
                })
            }
            ScheduleSpec::After { label, delay } => {
                self.spawn_after(task_id, cancellation, label, delay, job)
            }
            ScheduleSpec::Cron { label, schedule } => {
                self.spawn_cron(task_id, cancellation, label, *schedule, job)
            }
        }
    }

    async fn run_job(&self, job: Arc<JobFn>, ctx: ScheduleContext) -> JobResult {
        if ctx.cancellation.is_cancelled() {
            return JobResult::Stop;
        }

        AssertUnwindSafe((job.clone())(ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                let task = ctx.task_id.0.to_string();
                log_error(
                    COMPONENT,
                    "Task panicked; stopping task",
                    &[("task_id", task.as_str()), ("label", ctx.label)],
                );
                JobResult::Stop
            })
    }

    fn spawn_after(
        &self,
        task_id: TaskId,
        cancellation: CancellationToken,
        label: &'static str,
        delay: Duration,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let scheduled_for = ChronoDuration::from_std(delay)
            .ok()
            .map(|delta| Utc::now() + delta);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            let ctx = ScheduleContext::new(task_id, label, cancellation, scheduled_for);
            let _ = scheduler.run_job(job, ctx).await;
        })
    }

    fn spawn_cron(
        &self,
        task_id: TaskId,
        cancellation: CancellationToken,
        label: &'static str,
        schedule: CronSchedule,
        job: Arc<JobFn>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut next = schedule.next_after(Utc::now());
            while let Some(run_at) = next {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = time::sleep(duration_until(run_at)) => {}
                }

                let ctx = ScheduleContext::new(task_id, label, cancellation.clone(), Some(run_at));
                let result = scheduler.run_job(job.clone(), ctx).await;
                if matches!(result, JobResult::Stop) {
                    break;
                }

                next = schedule.next_after(run_at + ChronoDuration::seconds(1));
            }
        })
    }
}

impl ScheduledTaskHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn abort(&self) {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn cancel_and_abort(&self) {
        self.cancel();
        self.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    #[cfg(test)]
    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        let maybe_handle = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match maybe_handle {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

impl Drop for ScheduledTaskHandle {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

fn duration_until(run_at: DateTime<Utc>) -> Duration {
    (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn standard_expressions_gain_seconds_and_shift_weekdays() {
        assert_eq!(translate_standard("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(translate_standard("30 2 * * 0").unwrap(), "0 30 2 * * 1");
        assert_eq!(translate_standard("0 0 * * 1-5").unwrap(), "0 0 0 * * 2-6");
        assert_eq!(translate_standard("0 0 * * */2").unwrap(), "0 0 0 * * */2");
        assert_eq!(translate_standard("0 0 * * 6,7").unwrap(), "0 0 0 * * 7,1");
        assert!(translate_standard("* * * *").is_err());
        assert!(CronSchedule::from_standard("61 * * * *").is_err());
    }

    #[test]
    fn next_tick_is_on_the_minute() {
        let schedule = CronSchedule::from_standard("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 42).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 16, 0).unwrap());
    }

    #[tokio::test]
    async fn delayed_task_executes() {
        let scheduler = Scheduler::global();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = scheduler.schedule(
            ScheduleSpec::After {
                label: "delayed",
                delay: Duration::from_millis(20),
            },
            move |ctx| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    assert_eq!(ctx.label(), "delayed");
                    assert!(ctx.scheduled_for().is_some());
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Stop
                })
            },
        );

        handle.join().await.expect("join should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_task_repeats_until_stopped() {
        let executions = Arc::new(AtomicUsize::new(0));
        let executions_clone = executions.clone();
        let schedule = CronSchedule::parse("*/1 * * * * *", chrono_tz::UTC).expect("cron");

        let handle = Scheduler::global().schedule(
            ScheduleSpec::Cron {
                label: "cron",
                schedule: Box::new(schedule),
            },
            move |_| {
                let executions = executions_clone.clone();
                Box::pin(async move {
                    let count = executions.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= 2 {
                        JobResult::Stop
                    } else {
                        JobResult::Continue
                    }
                })
            },
        );

        time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cron finished")
            .expect("join");
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_handle_cancels_pending_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let handle = Scheduler::global().schedule(
            ScheduleSpec::After {
                label: "dropped",
                delay: Duration::from_millis(30),
            },
            move |_| {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Stop
                })
            },
        );
        drop(handle);
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
