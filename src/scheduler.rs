use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// When a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Fire this many times.
    Iterations(u64),
    /// Keep firing until this much time has passed since the run started.
    Elapsed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fired: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Scheduler {
    interval: Duration,
    stop: StopCondition,
    cancel: CancellationToken,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(interval_ms: u64, stop: StopCondition) -> Result<Self> {
        if interval_ms == 0 && matches!(stop, StopCondition::Elapsed(_)) {
            bail!("a time-bounded run needs a non-zero probe interval");
        }
        let (state, _) = watch::channel(SchedulerState::Idle);
        Ok(Self {
            interval: Duration::from_millis(interval_ms),
            stop,
            cancel: CancellationToken::new(),
            state,
        })
    }

    /// Token that stops the trigger when cancelled. In-flight jobs are still
    /// awaited before `run` returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// job: called once per tick with the 1-based iteration number.
    ///
    /// The returned future is spawned so the next tick is unaffected by job
    /// duration; overlapping jobs are not prevented. A failed job is logged
    /// and counted, and the run carries on.
    pub async fn run<J, F, E>(&self, mut job: J) -> Result<RunSummary>
    where
        J: FnMut(u64) -> F,
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            claimed = *state == SchedulerState::Idle;
            if claimed {
                *state = SchedulerState::Running;
            }
            claimed
        });
        if !claimed {
            bail!("scheduler has already been started");
        }

        let started = Instant::now();
        let deadline = match self.stop {
            StopCondition::Elapsed(window) => Some(started + window),
            StopCondition::Iterations(_) => None,
        };
        info!("scheduler running every {:?} until {:?}", self.interval, self.stop);

        let mut summary = RunSummary::default();
        let mut in_flight = JoinSet::new();
        let mut next = started;

        loop {
            if let StopCondition::Iterations(limit) = self.stop {
                if summary.fired >= limit {
                    break;
                }
            }

            // Past the window: only wait out the remainder, never fire.
            let (wake, fire) = match deadline {
                Some(end) if next >= end => (end, false),
                _ => (next, true),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("scheduler cancelled after {} iterations", summary.fired);
                    break;
                }
                Some(joined) = in_flight.join_next() => {
                    record(&mut summary, joined);
                    continue;
                }
                _ = sleep_until(wake) => {}
            }

            if !fire {
                break;
            }

            summary.fired += 1;
            let iteration = summary.fired;
            debug!("firing iteration {}", iteration);
            let fut = job(iteration);
            in_flight.spawn(async move { (iteration, fut.await) });
            next += self.interval;
        }

        self.state.send_replace(SchedulerState::Stopped);

        while let Some(joined) = in_flight.join_next().await {
            record(&mut summary, joined);
        }
        info!(
            "scheduler stopped: {} fired, {} succeeded, {} failed",
            summary.fired, summary.succeeded, summary.failed
        );
        Ok(summary)
    }
}

type Joined<E> = std::result::Result<(u64, std::result::Result<(), E>), JoinError>;

fn record<E: Display>(summary: &mut RunSummary, joined: Joined<E>) {
    match joined {
        Ok((_, Ok(()))) => summary.succeeded += 1,
        Ok((iteration, Err(e))) => {
            summary.failed += 1;
            error!("iteration {} failed: {}", iteration, e);
        }
        Err(e) => {
            summary.failed += 1;
            warn!("iteration task did not complete: {}", e);
        }
    }
}
