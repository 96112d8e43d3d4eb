//! The sequential multi-stream acquisition engine.
//!
//! One task owns one acquisition series: it sorts the streams into priority
//! order, acquires them strictly one after another (sibling streams contend
//! for the same physical detector or scanning beam, so there is no
//! parallelism inside a series), tracks the remaining duration, forwards
//! cancellation into whichever sub-acquisition is active, and collects the
//! results.
//!
//! # State machine
//!
//! ```text
//! Running ──cancel()──> Cancelled     (terminal)
//!    │
//!    └──run() returns──> Finished     (terminal)
//! ```
//!
//! A failure on the very first stream is fatal (`Failed`); a failure on any
//! later stream stops the series but returns everything collected so far
//! together with the error, so partial success is a first-class outcome.
//!
//! # Shared state
//!
//! Only the state flag, the current sub-future pointer and the
//! not-yet-started count are touched from more than one task: the engine's
//! own run loop and whichever context calls [`AcquisitionTask::cancel`].
//! All three live behind one mutex. Everything else is loop-local.

use super::reconcile::reconcile;
use super::zstack::{assemble_z_cube, estimate_z_stack_duration, focus_step_estimate, ZLevelMap};
use crate::data::RawResult;
use crate::error::AcqError;
use crate::metadata::MetadataKey;
use crate::settings::SettingsObserver;
use crate::stream::{sort_streams, Focuser, Leech, ProgressUpdate, Stream, StreamRef, SubFuture};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of an acquisition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The series is running (or about to).
    Running,
    /// Cancellation was requested; terminal.
    Cancelled,
    /// The series ran to its natural end; terminal.
    Finished,
}

impl TaskState {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Final outcome of one acquisition series.
///
/// Expected branches are modelled as data rather than raises: callers must
/// check `error` even when results are present, since partial success is an
/// explicit outcome.
#[derive(Debug)]
pub enum AcquisitionOutcome {
    /// The series ran to its end. `error` is set when a later stream failed
    /// and the series stopped early with partial results.
    Completed {
        /// Collected results, in acquisition order.
        results: Vec<RawResult>,
        /// The failure that stopped the series early, if any.
        error: Option<AcqError>,
    },
    /// A cancellation request won; no results are returned.
    Cancelled,
    /// The very first stream failed; no results exist.
    Failed(AcqError),
}

impl AcquisitionOutcome {
    /// Collected results (empty for `Cancelled` and `Failed`).
    pub fn results(&self) -> &[RawResult] {
        match self {
            AcquisitionOutcome::Completed { results, .. } => results,
            _ => &[],
        }
    }

    /// The error attached to this outcome, if any.
    pub fn error(&self) -> Option<&AcqError> {
        match self {
            AcquisitionOutcome::Completed { error, .. } => error.as_ref(),
            AcquisitionOutcome::Cancelled => None,
            AcquisitionOutcome::Failed(e) => Some(e),
        }
    }

    /// Whether this outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquisitionOutcome::Cancelled)
    }

    /// Flatten into the classic `(results, error)` pair.
    pub fn into_parts(self) -> (Vec<RawResult>, Option<AcqError>) {
        match self {
            AcquisitionOutcome::Completed { results, error } => (results, error),
            AcquisitionOutcome::Cancelled => (Vec::new(), Some(AcqError::Cancelled)),
            AcquisitionOutcome::Failed(e) => (Vec::new(), Some(e)),
        }
    }
}

/// Live progress of a running job.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Current estimate of when the whole series will finish.
    pub estimated_end: DateTime<Utc>,
}

struct CurrentAcquisition {
    index: usize,
    handle: Arc<dyn SubFuture>,
}

struct TaskShared {
    state: TaskState,
    current: Option<CurrentAcquisition>,
    /// Streams not yet started.
    pending: usize,
}

/// Everything the run loop consumes; taken out of the task when `run`
/// starts and dropped when it ends, so no stream or hardware references are
/// retained past completion.
struct TaskInputs {
    streams: Vec<StreamRef>,
    z_levels: ZLevelMap,
    settings: Option<Arc<SettingsObserver>>,
}

/// Per-stream time bookkeeping, computed once up front.
struct StreamBudget {
    estimate: f64,
    focus_step: f64,
}

/// One priority-ordered, cancellable multi-stream acquisition.
pub struct AcquisitionTask {
    inputs: Mutex<Option<TaskInputs>>,
    shared: Arc<Mutex<TaskShared>>,
    progress_tx: watch::Sender<Progress>,
    watchdog: Option<Duration>,
}

impl AcquisitionTask {
    /// Create a task over `streams`. Returns the task and the receiver for
    /// its progress updates.
    pub(crate) fn new(
        streams: Vec<StreamRef>,
        z_levels: ZLevelMap,
        settings: Option<Arc<SettingsObserver>>,
        watchdog: Option<Duration>,
    ) -> (Self, watch::Receiver<Progress>) {
        let initial_end =
            Utc::now() + secs_to_chrono(estimate_z_stack_duration(&streams, &z_levels));
        let (progress_tx, progress_rx) = watch::channel(Progress {
            estimated_end: initial_end,
        });
        let shared = Arc::new(Mutex::new(TaskShared {
            state: TaskState::Running,
            current: None,
            pending: streams.len(),
        }));
        let task = Self {
            inputs: Mutex::new(Some(TaskInputs {
                streams,
                z_levels,
                settings,
            })),
            shared,
            progress_tx,
            watchdog,
        };
        (task, progress_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.shared_lock().state
    }

    /// Request cancellation. May be called from any task or thread.
    ///
    /// Sets the cancellation flag and forwards the request into the
    /// currently running sub-acquisition, if there is one. Returns `false`
    /// only when it is certainly too late: the series already finished, or
    /// forwarding failed and no stream was left un-started.
    pub fn cancel(&self) -> bool {
        let mut shared = self.shared_lock();
        match shared.state {
            TaskState::Finished => false,
            TaskState::Cancelled => true,
            TaskState::Running => {
                shared.state = TaskState::Cancelled;
                info!("acquisition cancellation requested");
                let forwarded = shared
                    .current
                    .as_ref()
                    .map(|c| c.handle.cancel())
                    .unwrap_or(false);
                forwarded || shared.pending > 0
            }
        }
    }

    /// Run the series to completion. Consumes the task's inputs; calling it
    /// a second time yields `Failed`.
    pub(crate) async fn run(&self) -> AcquisitionOutcome {
        let inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(inputs) = inputs else {
            return AcquisitionOutcome::Failed(AcqError::TaskAborted(
                "acquisition task already ran".to_string(),
            ));
        };

        let outcome = self.run_series(inputs).await;

        // Clear task-owned references whatever the outcome, so streams and
        // sub-futures are not retained after completion.
        let mut shared = self.shared_lock();
        shared.current = None;
        shared.pending = 0;
        shared.state = if outcome.is_cancelled() {
            TaskState::Cancelled
        } else {
            TaskState::Finished
        };
        outcome
    }

    async fn run_series(&self, inputs: TaskInputs) -> AcquisitionOutcome {
        let TaskInputs {
            streams,
            z_levels,
            settings,
        } = inputs;

        // Snapshot-sort and estimate once up front; estimates are only
        // refreshed through sub-future progress callbacks.
        let streams = sort_streams(&streams);
        let budgets: Vec<StreamBudget> = streams
            .iter()
            .map(|stream| {
                let levels = z_levels.levels_for(stream).unwrap_or(&[]);
                StreamBudget {
                    estimate: stream.estimate_acquisition_time(),
                    focus_step: focus_step_estimate(stream, levels),
                }
            })
            .collect();
        let mut remaining: f64 = streams
            .iter()
            .zip(&budgets)
            .map(|(stream, budget)| {
                let count = z_levels
                    .levels_for(stream)
                    .map(|levels| levels.len().max(1))
                    .unwrap_or(1);
                budget.estimate * count as f64 + budget.focus_step * (count - 1) as f64
            })
            .sum();
        self.publish_remaining(remaining);
        info!(
            streams = streams.len(),
            estimate_s = remaining,
            "starting acquisition series"
        );

        for stream in &streams {
            for leech in stream.leeches() {
                if let Err(e) = leech.series_start() {
                    warn!(
                        stream = stream.name(),
                        error = %e,
                        "leech failed at series start, ignoring"
                    );
                }
            }
        }

        let mut collected: Vec<(StreamRef, Vec<RawResult>)> = Vec::new();
        let mut series_error: Option<AcqError> = None;

        for (index, stream) in streams.iter().enumerate() {
            {
                let mut shared = self.shared_lock();
                if shared.state == TaskState::Cancelled {
                    info!(stream = stream.name(), "cancelled before stream start");
                    return AcquisitionOutcome::Cancelled;
                }
                shared.pending -= 1;
            }

            debug!(stream = stream.name(), index, "acquiring stream");
            let levels: Vec<f64> = z_levels
                .levels_for(stream)
                .map(<[f64]>::to_vec)
                .unwrap_or_default();
            let acquired = self
                .acquire_stream(
                    index,
                    stream,
                    &levels,
                    &budgets[index],
                    &mut remaining,
                    settings.as_deref(),
                )
                .await;
            match acquired {
                Ok(raws) => collected.push((stream.clone(), raws)),
                Err(AcqError::Cancelled) => {
                    info!(stream = stream.name(), "acquisition cancelled");
                    return AcquisitionOutcome::Cancelled;
                }
                Err(e) if index == 0 => {
                    warn!(stream = stream.name(), error = %e, "first stream failed");
                    return AcquisitionOutcome::Failed(e);
                }
                Err(e) => {
                    warn!(
                        stream = stream.name(),
                        error = %e,
                        "stream failed, returning partial results"
                    );
                    series_error = Some(e);
                    break;
                }
            }
        }

        // Leeches see the end of the series only when nothing aborted it.
        if series_error.is_none() {
            for stream in &streams {
                let raw = stream.raw();
                for leech in stream.leeches() {
                    if let Err(e) = leech.series_complete(&raw) {
                        warn!(
                            stream = stream.name(),
                            error = %e,
                            "leech failed at series completion, ignoring"
                        );
                    }
                }
            }
        }

        let reconciled = reconcile(collected);
        let results: Vec<RawResult> = reconciled.into_iter().flat_map(|(_, raws)| raws).collect();
        info!(
            results = results.len(),
            partial = series_error.is_some(),
            "acquisition series finished"
        );
        AcquisitionOutcome::Completed {
            results,
            error: series_error,
        }
    }

    /// Acquire one stream, repeating per Z level when it is Z-stacked.
    async fn acquire_stream(
        &self,
        index: usize,
        stream: &StreamRef,
        levels: &[f64],
        budget: &StreamBudget,
        remaining: &mut f64,
        settings: Option<&SettingsObserver>,
    ) -> Result<Vec<RawResult>, AcqError> {
        // A single listed Z level incurs no focuser move and behaves like a
        // plain acquisition.
        if levels.len() <= 1 {
            let raws = self
                .acquire_once(index, stream, *remaining - budget.estimate, settings)
                .await?;
            *remaining = (*remaining - budget.estimate).max(0.0);
            self.publish_remaining(*remaining);
            return Ok(raws);
        }

        let focuser = stream.focuser().ok_or_else(|| {
            AcqError::InvalidZLevels(format!("stream '{}' has no focuser", stream.name()))
        })?;

        let mut slices: Vec<(f64, RawResult)> = Vec::new();
        let last = levels.len() - 1;
        for (step, &z) in levels.iter().enumerate() {
            self.check_cancelled()?;
            focuser
                .move_abs(z)
                .await
                .map_err(|source| AcqError::FocusMoveFailed {
                    stream: stream.name().to_string(),
                    position_m: z,
                    source,
                })?;
            self.check_cancelled()?;

            let raws = self
                .acquire_once(index, stream, *remaining - budget.estimate, settings)
                .await?;

            *remaining -= budget.estimate;
            if step < last {
                *remaining -= budget.focus_step;
            }
            *remaining = remaining.max(0.0);
            self.publish_remaining(*remaining);

            let mut raws = raws.into_iter();
            match raws.next() {
                Some(slice) => {
                    if raws.next().is_some() {
                        warn!(
                            stream = stream.name(),
                            z, "Z-level acquisition produced extra results, keeping the first"
                        );
                    }
                    slices.push((z, slice));
                }
                None => warn!(stream = stream.name(), z, "no slice produced at Z level"),
            }
        }
        Ok(vec![assemble_z_cube(stream.name(), slices)])
    }

    /// One sub-acquisition: start it, record it as current, forward its
    /// progress, wait for its result and stamp settings metadata.
    async fn acquire_once(
        &self,
        index: usize,
        stream: &StreamRef,
        pending_after: f64,
        settings: Option<&SettingsObserver>,
    ) -> Result<Vec<RawResult>, AcqError> {
        let handle = stream.acquire();
        {
            let mut shared = self.shared_lock();
            if shared.state == TaskState::Cancelled {
                handle.cancel();
                return Err(AcqError::Cancelled);
            }
            shared.current = Some(CurrentAcquisition {
                index,
                handle: handle.clone(),
            });
        }

        let forwarder = handle
            .progress()
            .map(|rx| self.spawn_progress_forwarder(index, rx, pending_after.max(0.0)));

        let waited = match self.watchdog {
            Some(timeout) => match tokio::time::timeout(timeout, handle.result()).await {
                Ok(result) => result,
                Err(_) => {
                    handle.cancel();
                    self.finish_sub_acquisition(forwarder);
                    return Err(AcqError::WatchdogExpired {
                        stream: stream.name().to_string(),
                        timeout,
                    });
                }
            },
            None => handle.result().await,
        };
        self.finish_sub_acquisition(forwarder);

        let mut raws = match waited {
            Ok(raws) => raws,
            Err(source) => {
                // A cancellation interrupting the sub-acquisition surfaces
                // as its error; report it as a cancellation, not a failure.
                if self.is_cancelled() {
                    return Err(AcqError::Cancelled);
                }
                return Err(AcqError::StreamFailed {
                    stream: stream.name().to_string(),
                    source,
                });
            }
        };
        if self.is_cancelled() {
            return Err(AcqError::Cancelled);
        }
        if raws.is_empty() {
            warn!(
                stream = stream.name(),
                "acquisition returned no results, continuing with an empty set"
            );
        }

        if stream.embed_settings() {
            if let Some(observer) = settings {
                let snapshot =
                    serde_json::to_value(observer.all_settings()).unwrap_or(Value::Null);
                for raw in &mut raws {
                    raw.metadata
                        .insert(MetadataKey::ExtraSettings, snapshot.clone());
                }
            }
        }
        Ok(raws)
    }

    /// Republish a sub-future's progress as the parent job's estimated end,
    /// adding the static estimates of the streams not yet started. Updates
    /// that lost a race (job done, or the sub-future is no longer current)
    /// are ignored.
    fn spawn_progress_forwarder(
        &self,
        index: usize,
        mut rx: watch::Receiver<ProgressUpdate>,
        pending_after: f64,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let progress_tx = self.progress_tx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let update = *rx.borrow();
                let is_current = {
                    let sh = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    sh.state == TaskState::Running
                        && sh.current.as_ref().map(|c| c.index) == Some(index)
                };
                if !is_current {
                    continue;
                }
                let _ = progress_tx.send(Progress {
                    estimated_end: update.end + secs_to_chrono(pending_after),
                });
            }
        })
    }

    fn finish_sub_acquisition(&self, forwarder: Option<JoinHandle<()>>) {
        if let Some(handle) = forwarder {
            handle.abort();
        }
        self.shared_lock().current = None;
    }

    fn publish_remaining(&self, remaining: f64) {
        let _ = self.progress_tx.send(Progress {
            estimated_end: Utc::now() + secs_to_chrono(remaining),
        });
    }

    fn is_cancelled(&self) -> bool {
        self.shared_lock().state == TaskState::Cancelled
    }

    fn check_cancelled(&self) -> Result<(), AcqError> {
        if self.is_cancelled() {
            Err(AcqError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn shared_lock(&self) -> MutexGuard<'_, TaskShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn secs_to_chrono(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds * 1e3) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStream;
    use crate::stream::StreamKind;

    fn plain(name: &str) -> StreamRef {
        Arc::new(MockStream::new(name, StreamKind::Optical))
    }

    #[test]
    fn test_state_terminality() {
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Finished.is_terminal());
    }

    #[test]
    fn test_outcome_into_parts() {
        let (results, error) = AcquisitionOutcome::Cancelled.into_parts();
        assert!(results.is_empty());
        assert!(matches!(error, Some(AcqError::Cancelled)));

        let (results, error) = AcquisitionOutcome::Completed {
            results: vec![RawResult::new(vec![1], vec![1])],
            error: None,
        }
        .into_parts();
        assert_eq!(results.len(), 1);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_start_yields_no_results() {
        let (task, _rx) = AcquisitionTask::new(
            vec![plain("a"), plain("b")],
            ZLevelMap::new(),
            None,
            None,
        );
        assert!(task.cancel());
        let outcome = task.run().await;
        assert!(outcome.is_cancelled());
        assert!(outcome.results().is_empty());
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_finish_returns_false() {
        let (task, _rx) = AcquisitionTask::new(vec![plain("a")], ZLevelMap::new(), None, None);
        let outcome = task.run().await;
        assert!(outcome.error().is_none());
        assert_eq!(task.state(), TaskState::Finished);
        assert!(!task.cancel());
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (task, _rx) = AcquisitionTask::new(vec![plain("a")], ZLevelMap::new(), None, None);
        task.run().await;
        assert!(matches!(
            task.run().await,
            AcquisitionOutcome::Failed(AcqError::TaskAborted(_))
        ));
    }
}
