//! Selective Rate Reporter
//!
//! Flushes different identities at different periods. Each configured period
//! gets its own recurring task that snapshots only identities labeled with
//! that period; one more task at the default period covers everything else.
//!
//! # Reconfiguration
//!
//! A supervisor task watches the configuration channel. On every change it
//! derives a new [`ReportingPlan`], spawns the new task set, swaps it into the
//! task list under a lock held only for the swap, then cancels and awaits the
//! old set outside the lock. An invalid update is logged and the running
//! schedule is kept.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::config::SelectiveRateConfig;
use super::sink::ReportSink;
use crate::engine::ProfilerReporter;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::labels::{
    contains_label, LabelSticker, Labels, NoopLabelSticker, RegexpLabelSticker, ReportFilter,
};
use crate::profiler::Profiler;

/// Label carrying an identity's reporting period in milliseconds
pub const RATE_LABEL: &str = "logRate";

// =============================================================================
// Plan
// =============================================================================

/// One recurring snapshot task
#[derive(Clone)]
pub struct ReportingGroup {
    pub period: Duration,
    /// `None` snapshots every identity
    pub filter: Option<ReportFilter>,
}

impl std::fmt::Debug for ReportingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportingGroup")
            .field("period", &self.period)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Sticker and task groups derived from a configuration
pub struct ReportingPlan {
    pub sticker: Arc<dyn LabelSticker>,
    pub groups: Vec<ReportingGroup>,
}

impl ReportingPlan {
    pub fn periods(&self) -> Vec<Duration> {
        self.groups.iter().map(|g| g.period).collect()
    }
}

/// Derive the sticker and task groups for `config`.
///
/// With an empty schedule there is a single unfiltered group at the default
/// period. Otherwise each period gets a group selecting `logRate == period`,
/// labeled by the first entry in declared order whose patterns match, and
/// the default group selects identities whose label is missing or names
/// a period no longer scheduled, so every identity belongs to exactly one
/// group.
pub fn plan(config: &SelectiveRateConfig) -> Result<ReportingPlan> {
    config.validate()?;

    if config.reporting_schedule.is_empty() {
        return Ok(ReportingPlan {
            sticker: Arc::new(NoopLabelSticker),
            groups: vec![ReportingGroup {
                period: config.default_period(),
                filter: None,
            }],
        });
    }

    let sticker = RegexpLabelSticker::new(
        RATE_LABEL,
        config
            .reporting_schedule
            .iter()
            .map(|(period, patterns)| (period.to_string(), patterns)),
    )?;

    let mut groups: Vec<ReportingGroup> = config
        .reporting_schedule
        .periods()
        .map(|period| ReportingGroup {
            period: Duration::from_millis(period),
            filter: Some(contains_label(RATE_LABEL, period.to_string())),
        })
        .collect();

    let scheduled: HashSet<String> = config
        .reporting_schedule
        .periods()
        .map(|period| period.to_string())
        .collect();
    let unscheduled: ReportFilter = Arc::new(move |_: &Identity, labels: &Labels| {
        labels
            .get(RATE_LABEL)
            .map_or(true, |period| !scheduled.contains(period))
    });
    groups.push(ReportingGroup {
        period: config.default_period(),
        filter: Some(unscheduled),
    });

    Ok(ReportingPlan {
        sticker: Arc::new(sticker),
        groups,
    })
}

// =============================================================================
// Reporter
// =============================================================================

struct ScheduledTask {
    period: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    reporter: ProfilerReporter,
    sink: Arc<dyn ReportSink>,
    runtime: Handle,
    tasks: Mutex<Vec<ScheduledTask>>,
    enable_reporting: AtomicBool,
    running_tasks: AtomicUsize,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Periodically flushes profiler reports to a sink at per-identity rates
pub struct SelectiveRateReporter {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SelectiveRateReporter {
    /// Create a reporter on `profiler` and schedule flushes per `config`.
    ///
    /// Must be called within a tokio runtime. The initial configuration is
    /// validated and rejected with an error; later updates received through
    /// `config` are applied as they arrive.
    pub fn start(
        profiler: &Profiler,
        mut config: watch::Receiver<SelectiveRateConfig>,
        sink: impl ReportSink + 'static,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::Internal(format!("selective rate reporter needs a tokio runtime: {}", e))
        })?;

        let initial = config.borrow_and_update().clone();
        let initial_plan = plan(&initial)?;

        let shared = Arc::new(Shared {
            reporter: profiler.create_reporter(),
            sink: Arc::new(sink),
            runtime: runtime.clone(),
            tasks: Mutex::new(Vec::new()),
            enable_reporting: AtomicBool::new(initial.enable_reporting),
            running_tasks: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let replaced = shared.install(initial_plan, initial.enable_reporting);
        debug_assert!(replaced.is_empty());
        info!(
            default_period_ms = initial.default_period_ms,
            schedules = initial.reporting_schedule.len(),
            "Selective rate reporter started"
        );

        let supervisor = runtime.spawn(supervise(shared.clone(), config));

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Periods of the currently installed task set
    pub fn scheduled_periods(&self) -> Vec<Duration> {
        self.shared.tasks.lock().iter().map(|t| t.period).collect()
    }

    /// Number of task loops currently running
    pub fn running_task_count(&self) -> usize {
        self.shared.running_tasks.load(Ordering::Acquire)
    }

    /// Snapshot and flush every identity now, outside the schedule.
    ///
    /// Runs on the caller's thread; sink errors and panics are logged.
    pub fn flush_now(&self) {
        self.shared.flush(None);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop all tasks and release the profiler reporter. Idempotent.
    ///
    /// A flush already in progress completes in the background.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Close and wait for every task to exit
    pub async fn shutdown(&self) {
        let tasks = self.shared.close();
        let supervisor = self.supervisor.lock().take();

        stop_tasks(tasks).await;
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Schedule supervisor ended abnormally");
            }
        }
    }
}

impl Drop for SelectiveRateReporter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Shared {
    /// Spawn `plan`'s tasks and swap them in; returns the replaced set
    fn install(self: &Arc<Self>, plan: ReportingPlan, enable_reporting: bool) -> Vec<ScheduledTask> {
        self.reporter.set_label_sticker(plan.sticker);
        self.enable_reporting
            .store(enable_reporting, Ordering::Release);

        let fresh: Vec<ScheduledTask> = plan
            .groups
            .into_iter()
            .map(|group| self.spawn_group(group))
            .collect();

        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(tasks);
            fresh.iter().for_each(|t| t.token.cancel());
            return fresh;
        }
        std::mem::replace(&mut *tasks, fresh)
    }

    fn spawn_group(self: &Arc<Self>, group: ReportingGroup) -> ScheduledTask {
        let token = self.shutdown.child_token();
        let handle = self.runtime.spawn(run_group(
            self.clone(),
            group.period,
            group.filter,
            token.clone(),
        ));
        ScheduledTask {
            period: group.period,
            token,
            handle,
        }
    }

    /// Build one report and hand it to the sink unless reporting is disabled
    fn flush(&self, filter: Option<&ReportFilter>) {
        let report = match filter {
            Some(filter) => self.reporter.build_report_and_reset_with(filter),
            None => self.reporter.build_report_and_reset(),
        };

        if !self.enable_reporting.load(Ordering::Acquire) {
            debug!(
                calls = report.profiler_call_reports.len(),
                "Reporting disabled, discarding report"
            );
            return;
        }

        match catch_unwind(AssertUnwindSafe(|| self.sink.store(report))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Failed to store profiler report");
            }
            Err(_) => {
                error!("Report sink panicked");
            }
        }
    }

    fn close(&self) -> Vec<ScheduledTask> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.iter().for_each(|t| t.token.cancel());
        self.reporter.close();
        info!("Selective rate reporter closed");
        tasks
    }
}

async fn stop_tasks(tasks: Vec<ScheduledTask>) {
    tasks.iter().for_each(|t| t.token.cancel());
    for result in join_all(tasks.into_iter().map(|t| t.handle)).await {
        if let Err(e) = result {
            warn!(error = %e, "Reporting task ended abnormally");
        }
    }
}

#[instrument(skip_all)]
async fn supervise(shared: Arc<Shared>, mut config: watch::Receiver<SelectiveRateConfig>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,

            changed = config.changed() => {
                if changed.is_err() {
                    debug!("Configuration source dropped, keeping current schedule");
                    break;
                }

                let update = config.borrow_and_update().clone();
                match plan(&update) {
                    Ok(plan) => {
                        let periods = plan.periods();
                        let replaced = shared.install(plan, update.enable_reporting);
                        stop_tasks(replaced).await;
                        info!(?periods, enable_reporting = update.enable_reporting, "Reporting schedule updated");
                    }
                    Err(e) => {
                        error!(error = %e, "Rejected reporting configuration, keeping current schedule");
                    }
                }
            }
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[instrument(skip(shared, filter, token), fields(period_ms = period.as_millis() as u64))]
async fn run_group(
    shared: Arc<Shared>,
    period: Duration,
    filter: Option<ReportFilter>,
    token: CancellationToken,
) {
    let _running = RunningGuard::enter(&shared.running_tasks);
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Reporting task stopped");
                break;
            }

            _ = tick.tick() => {
                let flushing = shared.clone();
                let filter = filter.clone();
                let outcome = tokio::task::spawn_blocking(move || flushing.flush(filter.as_ref())).await;
                if let Err(e) = outcome {
                    error!(error = %e, "Report flush panicked");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
