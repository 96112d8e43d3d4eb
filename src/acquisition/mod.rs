//! Acquisition entry points and the job handle.
//!
//! [`acquire`] and [`acquire_z_stack`] wire the priority sorting, the
//! sequential engine, the settings-snapshot collector and the metadata
//! reconciler into one cancellable, progress-reporting [`AcquisitionJob`].
//! Each call spawns one background tokio task; inside it, streams are
//! acquired strictly one after another.
//!
//! # Example
//!
//! ```rust,ignore
//! use scope_acq::acquisition::{acquire, AcquisitionOutcome};
//!
//! let job = acquire(&streams, None);
//! println!("expected to finish at {}", job.estimated_end());
//!
//! match job.result(None).await? {
//!     AcquisitionOutcome::Completed { results, error } => {
//!         // Partial success is a first-class outcome: check `error` even
//!         // when `results` is non-empty.
//!     }
//!     AcquisitionOutcome::Cancelled => { /* nothing was kept */ }
//!     AcquisitionOutcome::Failed(e) => return Err(e),
//! }
//! ```

pub mod reconcile;
pub mod task;
pub mod zstack;

pub use reconcile::reconcile;
pub use task::{AcquisitionOutcome, AcquisitionTask, Progress, TaskState};
pub use zstack::{estimate_z_stack_duration, ZLevelMap};

use crate::config::Settings;
use crate::error::{AcqError, AcqResult};
use crate::settings::SettingsObserver;
use crate::stream::{Stream, StreamRef};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handle to one running acquisition series.
///
/// The job is terminal once its run completes or is cancelled, and its
/// result can be taken exactly once. The handle itself is what a caller
/// forwards to its cancellation UI.
pub struct AcquisitionJob {
    id: Uuid,
    task: Arc<AcquisitionTask>,
    handle: Mutex<Option<JoinHandle<AcquisitionOutcome>>>,
    progress_rx: watch::Receiver<Progress>,
}

impl AcquisitionJob {
    fn spawn(
        streams: Vec<StreamRef>,
        z_levels: ZLevelMap,
        observer: Option<Arc<SettingsObserver>>,
        watchdog: Option<Duration>,
    ) -> Self {
        let (task, progress_rx) = AcquisitionTask::new(streams, z_levels, observer, watchdog);
        let task = Arc::new(task);
        let runner = Arc::clone(&task);
        let handle = tokio::spawn(async move { runner.run().await });
        Self {
            id: Uuid::new_v4(),
            task,
            handle: Mutex::new(Some(handle)),
            progress_rx,
        }
    }

    /// Unique identifier of this job.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation. Returns `false` only when it is certainly too
    /// late ("it already completed").
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Whether the job reached a terminal state (finished or cancelled).
    pub fn done(&self) -> bool {
        self.task.state().is_terminal()
    }

    /// Wait for the outcome, optionally bounded by `timeout`.
    ///
    /// On timeout the job keeps running and the result can be requested
    /// again; once an outcome has been returned the job is consumed and a
    /// second call yields [`AcqError::ResultAlreadyTaken`].
    pub async fn result(&self, timeout: Option<Duration>) -> AcqResult<AcquisitionOutcome> {
        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut().ok_or(AcqError::ResultAlreadyTaken)?;
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut *handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(AcqError::ResultTimeout(limit)),
            },
            None => (&mut *handle).await,
        };
        *guard = None;
        joined.map_err(|e| AcqError::TaskAborted(e.to_string()))
    }

    /// Current estimate of when the series will finish.
    pub fn estimated_end(&self) -> DateTime<Utc> {
        self.progress_rx.borrow().estimated_end
    }

    /// Subscribe to live progress updates.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }
}

/// Start acquiring `streams` in priority order.
///
/// Must be called from within a tokio runtime. When `observer` is given,
/// streams that request it get their results stamped with a settings
/// snapshot.
pub fn acquire(streams: &[StreamRef], observer: Option<Arc<SettingsObserver>>) -> AcquisitionJob {
    acquire_with_config(streams, observer, &Settings::default())
}

/// [`acquire`] with explicit [`Settings`] (watchdog, etc.).
pub fn acquire_with_config(
    streams: &[StreamRef],
    observer: Option<Arc<SettingsObserver>>,
    settings: &Settings,
) -> AcquisitionJob {
    AcquisitionJob::spawn(
        streams.to_vec(),
        ZLevelMap::new(),
        observer,
        settings.acquisition.watchdog,
    )
}

/// Start a Z-stack acquisition: streams keyed in `z_levels` are acquired
/// once per listed Z position and their slices assembled into one Z-cube
/// result each.
///
/// Fails fast when the level map references a stream that is not in
/// `streams`, lists no levels, or requires a focuser the stream lacks.
pub fn acquire_z_stack(
    streams: &[StreamRef],
    z_levels: ZLevelMap,
    observer: Option<Arc<SettingsObserver>>,
) -> AcqResult<AcquisitionJob> {
    acquire_z_stack_with_config(streams, z_levels, observer, &Settings::default())
}

/// [`acquire_z_stack`] with explicit [`Settings`].
pub fn acquire_z_stack_with_config(
    streams: &[StreamRef],
    z_levels: ZLevelMap,
    observer: Option<Arc<SettingsObserver>>,
    settings: &Settings,
) -> AcqResult<AcquisitionJob> {
    z_levels.validate_against(streams)?;
    Ok(AcquisitionJob::spawn(
        streams.to_vec(),
        z_levels,
        observer,
        settings.acquisition.watchdog,
    ))
}

/// Expected total duration in seconds of a plain acquisition of `streams`.
pub fn estimate_duration(streams: &[StreamRef]) -> f64 {
    streams.iter().map(|s| s.estimate_acquisition_time()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStream;
    use crate::stream::StreamKind;

    #[test]
    fn test_estimate_duration_sums_streams() {
        let streams: Vec<StreamRef> = vec![
            Arc::new(MockStream::new("a", StreamKind::Optical).with_estimate(1.5)),
            Arc::new(MockStream::new("b", StreamKind::ElectronBeam).with_estimate(0.5)),
        ];
        assert!((estimate_duration(&streams) - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_z_stack_entry_rejects_unknown_stream() {
        let listed: StreamRef = Arc::new(MockStream::new("listed", StreamKind::Optical));
        let orphan: StreamRef = Arc::new(MockStream::new("orphan", StreamKind::Optical));
        let mut z_levels = ZLevelMap::new();
        z_levels.insert(orphan, vec![0.0]);

        let result = acquire_z_stack(&[listed], z_levels, None);
        assert!(matches!(result, Err(AcqError::InvalidZLevels(_))));
    }
}
