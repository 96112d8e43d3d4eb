//! Core library for coordinated multi-stream acquisition.
//!
//! This library schedules a set of independent imaging "streams" (each one a
//! live hardware pipeline) into a single ordered, cancellable,
//! progress-reporting acquisition job. Streams are prioritised so that
//! sensitive imaging modes run first, compatible streams are folded into
//! combined multi-channel units, and the collected results are reconciled
//! with fine-alignment metadata before being handed back to the caller.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod settings;
pub mod stream;

pub use acquisition::{acquire, acquire_z_stack, AcquisitionJob, AcquisitionOutcome};
pub use error::{AcqError, AcqResult};
