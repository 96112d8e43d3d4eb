//! Mock streams and hardware for testing without physical devices.
//!
//! All mocks use async-safe waits (`tokio::time::sleep`, never a blocking
//! sleep) and are safe to drive from multiple tasks.
//!
//! # Available mocks
//!
//! - [`MockStream`] - configurable stream: kind, timing, result count,
//!   scripted failures, progress reporting
//! - [`MockFocuser`] - focus actuator with speed-based move estimates and
//!   recorded move history
//! - [`MockComponent`] - component with watch-channel parameters for
//!   settings-snapshot tests
//! - [`RecordingLeech`] - counts series notifications, optionally failing

use super::{Focuser, Leech, ProgressUpdate, Stream, StreamKind, SubFuture};
use crate::data::RawResult;
use crate::metadata::MetadataKey;
use crate::settings::{Component, ParameterHandle};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

// =============================================================================
// MockStream
// =============================================================================

/// Configurable simulated stream.
///
/// Defaults: one 4x4 result per acquisition, 10 ms acquisition delay, 0.1 s
/// time estimate, no failures, no progress reporting.
pub struct MockStream {
    name: String,
    kind: StreamKind,
    estimate: f64,
    delay: Duration,
    results_per_acquisition: usize,
    shape: Vec<usize>,
    canned: Option<Vec<RawResult>>,
    fail_on_call: Option<usize>,
    emitter: Option<String>,
    focuser: Option<Arc<MockFocuser>>,
    leeches: Vec<Arc<dyn Leech>>,
    embed_settings: bool,
    report_progress: bool,
    acquire_calls: AtomicUsize,
    raw_store: Arc<Mutex<Vec<RawResult>>>,
}

impl MockStream {
    /// New mock stream with the given classification tag.
    pub fn new(name: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            estimate: 0.1,
            delay: Duration::from_millis(10),
            results_per_acquisition: 1,
            shape: vec![4, 4],
            canned: None,
            fail_on_call: None,
            emitter: None,
            focuser: None,
            leeches: Vec::new(),
            embed_settings: false,
            report_progress: false,
            acquire_calls: AtomicUsize::new(0),
            raw_store: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the per-acquisition time estimate in seconds.
    pub fn with_estimate(mut self, seconds: f64) -> Self {
        self.estimate = seconds;
        self
    }

    /// Set the simulated acquisition duration.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of results produced per acquisition.
    pub fn with_results(mut self, count: usize) -> Self {
        self.results_per_acquisition = count;
        self
    }

    /// Return exactly these results from every acquisition instead of
    /// generated data.
    pub fn with_canned_results(mut self, results: Vec<RawResult>) -> Self {
        self.canned = Some(results);
        self
    }

    /// Fail the n-th acquisition (0-based call index).
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Attach a scanner/emitter identity (for folding).
    pub fn with_emitter(mut self, emitter: impl Into<String>) -> Self {
        self.emitter = Some(emitter.into());
        self
    }

    /// Attach a focuser.
    pub fn with_focuser(mut self, focuser: Arc<MockFocuser>) -> Self {
        self.focuser = Some(focuser);
        self
    }

    /// Attach a leech.
    pub fn with_leech(mut self, leech: Arc<dyn Leech>) -> Self {
        self.leeches.push(leech);
        self
    }

    /// Request settings-snapshot stamping on this stream's results.
    pub fn with_embedded_settings(mut self) -> Self {
        self.embed_settings = true;
        self
    }

    /// Report progress updates from the acquisition handle.
    pub fn with_progress(mut self) -> Self {
        self.report_progress = true;
        self
    }

    /// How many times `acquire` has been called.
    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    fn generate_results(&self) -> Vec<RawResult> {
        if let Some(canned) = &self.canned {
            return canned.clone();
        }
        let len: usize = self.shape.iter().product();
        (0..self.results_per_acquisition)
            .map(|_| {
                let data = (0..len).map(|_| rand::random::<u16>()).collect();
                RawResult::new(data, self.shape.clone())
            })
            .collect()
    }
}

impl Stream for MockStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StreamKind {
        self.kind.clone()
    }

    fn estimate_acquisition_time(&self) -> f64 {
        self.estimate
    }

    fn acquire(&self) -> Arc<dyn SubFuture> {
        let call = self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let fail = (self.fail_on_call == Some(call))
            .then(|| format!("scripted failure on call {call}"));
        let (progress_tx, _) = watch::channel(ProgressUpdate::lasting(self.delay.as_secs_f64()));
        Arc::new(MockSubFuture {
            results: self.generate_results(),
            delay: self.delay,
            fail,
            cancelled: AtomicBool::new(false),
            progress_tx,
            report_progress: self.report_progress,
            raw_store: self.raw_store.clone(),
        })
    }

    fn leeches(&self) -> Vec<Arc<dyn Leech>> {
        self.leeches.clone()
    }

    fn focuser(&self) -> Option<Arc<dyn Focuser>> {
        self.focuser.clone().map(|f| f as Arc<dyn Focuser>)
    }

    fn emitter_id(&self) -> Option<String> {
        self.emitter.clone()
    }

    fn embed_settings(&self) -> bool {
        self.embed_settings
    }

    fn raw(&self) -> Vec<RawResult> {
        self.raw_store.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

struct MockSubFuture {
    results: Vec<RawResult>,
    delay: Duration,
    fail: Option<String>,
    cancelled: AtomicBool,
    progress_tx: watch::Sender<ProgressUpdate>,
    report_progress: bool,
    raw_store: Arc<Mutex<Vec<RawResult>>>,
}

#[async_trait]
impl SubFuture for MockSubFuture {
    async fn result(&self) -> Result<Vec<RawResult>> {
        if self.report_progress {
            let _ = self
                .progress_tx
                .send(ProgressUpdate::lasting(self.delay.as_secs_f64()));
        }
        let deadline = tokio::time::Instant::now() + self.delay;
        while tokio::time::Instant::now() < deadline {
            if self.cancelled.load(Ordering::SeqCst) {
                bail!("acquisition interrupted");
            }
            sleep(Duration::from_millis(2)).await;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            bail!("acquisition interrupted");
        }
        if let Some(message) = &self.fail {
            bail!("{message}");
        }
        if let Ok(mut store) = self.raw_store.lock() {
            store.extend(self.results.iter().cloned());
        }
        Ok(self.results.clone())
    }

    fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    fn progress(&self) -> Option<watch::Receiver<ProgressUpdate>> {
        self.report_progress
            .then(|| self.progress_tx.subscribe())
    }
}

/// A canned overlay result pair: first the optical correction carrier, then
/// the electron correction carrier.
pub fn overlay_results(optical: Value, electron: Value) -> Vec<RawResult> {
    vec![
        RawResult::new(vec![0], vec![1])
            .with_metadata(MetadataKey::CorrectionOptical, optical),
        RawResult::new(vec![0], vec![1])
            .with_metadata(MetadataKey::CorrectionElectron, electron),
    ]
}

// =============================================================================
// MockFocuser
// =============================================================================

/// Simulated focus actuator.
///
/// Moves take `|distance| / speed` (default 100 um/s) of simulated time,
/// scaled down so tests stay fast; every commanded position is recorded.
pub struct MockFocuser {
    position: Mutex<f64>,
    speed_m_per_s: f64,
    moves: Mutex<Vec<f64>>,
    fail_moves: AtomicBool,
}

impl MockFocuser {
    /// New focuser at position 0.0 m.
    pub fn new() -> Self {
        Self {
            position: Mutex::new(0.0),
            speed_m_per_s: 100e-6,
            moves: Mutex::new(Vec::new()),
            fail_moves: AtomicBool::new(false),
        }
    }

    /// Override the simulated speed.
    pub fn with_speed(mut self, speed_m_per_s: f64) -> Self {
        self.speed_m_per_s = speed_m_per_s;
        self
    }

    /// Make every subsequent move fail.
    pub fn fail_moves(&self) {
        self.fail_moves.store(true, Ordering::SeqCst);
    }

    /// Positions commanded so far, in order.
    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Current position in metres.
    pub fn position(&self) -> f64 {
        self.position.lock().map(|g| *g).unwrap_or(f64::NAN)
    }
}

impl Default for MockFocuser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Focuser for MockFocuser {
    async fn move_abs(&self, position_m: f64) -> Result<()> {
        if self.fail_moves.load(Ordering::SeqCst) {
            bail!("focuser jammed");
        }
        // 1000x faster than the estimate, so tests are quick but the move
        // still yields.
        let duration = self.estimate_move_duration(self.position(), position_m) / 1e3;
        sleep(Duration::from_secs_f64(duration.max(1e-4))).await;
        if let Ok(mut pos) = self.position.lock() {
            *pos = position_m;
        }
        if let Ok(mut moves) = self.moves.lock() {
            moves.push(position_m);
        }
        Ok(())
    }

    fn estimate_move_duration(&self, from_m: f64, to_m: f64) -> f64 {
        (to_m - from_m).abs() / self.speed_m_per_s
    }
}

// =============================================================================
// MockComponent
// =============================================================================

struct MockParameter {
    name: String,
    unit: Option<String>,
    tx: watch::Sender<Value>,
}

/// Component with watch-channel parameters, for settings-snapshot tests.
pub struct MockComponent {
    name: String,
    parameters: Vec<MockParameter>,
}

impl MockComponent {
    /// New component with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter with an initial value.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        unit: Option<&str>,
        initial: Value,
    ) -> Self {
        let (tx, _) = watch::channel(initial);
        self.parameters.push(MockParameter {
            name: name.into(),
            unit: unit.map(str::to_string),
            tx,
        });
        self
    }

    /// Change a parameter value, notifying subscribers.
    pub fn set(&self, parameter: &str, value: Value) -> Result<()> {
        let param = self
            .parameters
            .iter()
            .find(|p| p.name == parameter)
            .ok_or_else(|| anyhow::anyhow!("no parameter '{parameter}'"))?;
        param.tx.send(value)?;
        Ok(())
    }
}

impl Component for MockComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<ParameterHandle> {
        self.parameters
            .iter()
            .map(|p| ParameterHandle {
                name: p.name.clone(),
                unit: p.unit.clone(),
                rx: p.tx.subscribe(),
            })
            .collect()
    }
}

// =============================================================================
// RecordingLeech
// =============================================================================

/// Leech that counts notifications; can be scripted to fail.
#[derive(Default)]
pub struct RecordingLeech {
    starts: AtomicUsize,
    completes: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingLeech {
    /// New leech with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent notification fail.
    pub fn fail_notifications(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Number of `series_start` notifications received.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `series_complete` notifications received.
    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }
}

impl Leech for RecordingLeech {
    fn series_start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("leech bookkeeping failed");
        }
        Ok(())
    }

    fn series_complete(&self, _raw: &[RawResult]) -> Result<()> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("leech bookkeeping failed");
        }
        Ok(())
    }
}
