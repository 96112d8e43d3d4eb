//! Stream capability contracts.
//!
//! The acquisition core never owns a stream and never looks inside one.
//! Instead, every stream exposes a small capability surface: what kind of
//! imaging it performs (via a closed [`StreamKind`] tag attached at
//! construction), how long one acquisition is expected to take, how to start
//! an acquisition and obtain a waitable/cancellable handle for it, and which
//! optional collaborators (leeches, focuser) are attached.
//!
//! Classification is deliberately a tag enum rather than downcasting: the
//! scheduler matches on `StreamKind` with closed patterns, so an
//! unrecognized stream can only ever reach the explicit `Unknown` arm (which
//! is logged, never silently misordered).
//!
//! # Design
//!
//! Each capability trait:
//! - is object-safe and held as `Arc<dyn ...>` (stream identity is `Arc`
//!   pointer identity)
//! - is thread-safe (requires `Send + Sync`)
//! - uses `anyhow::Result` at the hardware boundary
//!
//! The async traits (`SubFuture`, `Focuser`) use `#[async_trait]`; the
//! purely descriptive `Stream` and `Leech` traits are synchronous.

pub mod folding;
pub mod mock;
pub mod weighting;

use crate::data::RawResult;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

pub use folding::{fold, CombinedStream};
pub use weighting::{sort_streams, weight};

/// Shared handle to a stream. Identity is pointer identity.
pub type StreamRef = Arc<dyn Stream>;

/// An ordered set of wavelength intervals in metres.
///
/// A single interval describes a plain bandpass filter; multiple intervals
/// describe a multi-band filter, for which no single centre wavelength
/// exists.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Band(Vec<(f64, f64)>);

impl Band {
    /// A single `[low, high]` interval.
    pub fn single(low_m: f64, high_m: f64) -> Self {
        Self(vec![(low_m, high_m)])
    }

    /// An arbitrary list of intervals.
    pub fn multi(intervals: Vec<(f64, f64)>) -> Self {
        Self(intervals)
    }

    /// No spectral information at all.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Centre wavelength, defined only for a single-interval band.
    pub fn center(&self) -> Option<f64> {
        match self.0.as_slice() {
            [(low, high)] => Some((low + high) / 2.0),
            _ => None,
        }
    }

    /// Centre of the first interval, whatever the band shape.
    pub fn first_center(&self) -> Option<f64> {
        self.0.first().map(|(low, high)| (low + high) / 2.0)
    }

    /// The raw intervals.
    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.0
    }
}

/// Closed classification tag attached to every stream at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamKind {
    /// Fluorescence imaging. Bleaches the sample, so it is scheduled first;
    /// `scanned` marks confocal-style streams driven by a shared scanner,
    /// which makes them foldable with compatible siblings.
    Fluorescence {
        /// Emission filter band.
        emission: Band,
        /// Excitation band.
        excitation: Band,
        /// Whether a shared scanner drives this stream.
        scanned: bool,
    },
    /// Other optical imaging (brightfield, etc.).
    Optical,
    /// Time-correlated / lifetime imaging.
    TimeCorrelated,
    /// Electron-beam imaging.
    ElectronBeam,
    /// Compound SEM multi-detector stream (CCD or temporally multiplexed).
    ScannedMultiDetector,
    /// Fine-alignment overlay pass; produces correction metadata only and is
    /// always scheduled last.
    Overlay,
    /// Not recognized by the scheduler. Sorted last and logged.
    Unknown,
}

impl StreamKind {
    /// Streams whose data receives the optical fine-alignment correction.
    pub fn is_optical_class(&self) -> bool {
        matches!(
            self,
            StreamKind::Fluorescence { .. } | StreamKind::Optical | StreamKind::TimeCorrelated
        )
    }

    /// Streams whose data receives the electron fine-alignment correction.
    pub fn is_electron_class(&self) -> bool {
        matches!(
            self,
            StreamKind::ElectronBeam | StreamKind::ScannedMultiDetector
        )
    }
}

/// Progress report from a running sub-acquisition.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// When the sub-acquisition started.
    pub start: DateTime<Utc>,
    /// Current estimate of when it will finish.
    pub end: DateTime<Utc>,
}

impl ProgressUpdate {
    /// An update spanning from now to `seconds` from now.
    pub fn lasting(seconds: f64) -> Self {
        let now = Utc::now();
        Self {
            start: now,
            end: now + chrono::Duration::milliseconds((seconds * 1e3) as i64),
        }
    }
}

/// Handle to one running stream acquisition.
#[async_trait]
pub trait SubFuture: Send + Sync {
    /// Wait for the acquisition to finish and return its results.
    async fn result(&self) -> Result<Vec<RawResult>>;

    /// Request cancellation. Returns `false` if the acquisition had already
    /// completed and could not be interrupted.
    fn cancel(&self) -> bool;

    /// Live progress updates, when the implementation supports them.
    fn progress(&self) -> Option<watch::Receiver<ProgressUpdate>> {
        None
    }
}

/// Observer notified at the start and end of a whole multi-stream series.
///
/// Leech failures are isolated: the scheduler logs them and continues as if
/// nothing happened.
pub trait Leech: Send + Sync {
    /// Called once before the first stream of a series starts.
    fn series_start(&self) -> Result<()>;

    /// Called once after the last stream of a series completes, with the
    /// owning stream's raw data.
    fn series_complete(&self, raw: &[RawResult]) -> Result<()>;
}

/// Focus actuator attached to a stream.
///
/// `move_abs` blocks until the move has settled, mirroring the contract of a
/// blocking stage move.
#[async_trait]
pub trait Focuser: Send + Sync {
    /// Move to an absolute Z position in metres and wait until settled.
    async fn move_abs(&self, position_m: f64) -> Result<()>;

    /// Estimated duration in seconds of a move between two positions.
    fn estimate_move_duration(&self, from_m: f64, to_m: f64) -> f64;
}

/// The capability contract every schedulable stream exposes.
pub trait Stream: Send + Sync {
    /// Display name, also used to stamp result descriptions.
    fn name(&self) -> &str;

    /// Classification tag assigned at construction.
    fn kind(&self) -> StreamKind;

    /// Expected duration in seconds of one acquisition.
    fn estimate_acquisition_time(&self) -> f64;

    /// Start one acquisition and return its handle.
    fn acquire(&self) -> Arc<dyn SubFuture>;

    /// Observers to notify at series boundaries.
    fn leeches(&self) -> Vec<Arc<dyn Leech>> {
        Vec::new()
    }

    /// Focus actuator, for streams that support Z-stacking.
    fn focuser(&self) -> Option<Arc<dyn Focuser>> {
        None
    }

    /// Identity of the physical emitter/scanner component driving this
    /// stream, used to decide whether two streams can share hardware.
    fn emitter_id(&self) -> Option<String> {
        None
    }

    /// Whether results should be stamped with a hardware settings snapshot.
    fn embed_settings(&self) -> bool {
        false
    }

    /// Data acquired so far, handed to leeches on series completion.
    fn raw(&self) -> Vec<RawResult> {
        Vec::new()
    }

    /// Member streams, for folded combined streams only.
    fn members(&self) -> Option<Vec<StreamRef>> {
        None
    }
}

/// Excitation band of a stream, when its kind carries one.
pub fn excitation_of(stream: &dyn Stream) -> Option<Band> {
    match stream.kind() {
        StreamKind::Fluorescence { excitation, .. } => Some(excitation),
        _ => None,
    }
}

/// Whether two stream handles refer to the same stream instance.
pub fn same_stream(a: &StreamRef, b: &StreamRef) -> bool {
    Arc::ptr_eq(a, b)
}
