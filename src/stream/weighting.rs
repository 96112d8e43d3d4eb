//! Acquisition priority weights.
//!
//! Acquisition order affects the sample itself: fluorescence bleaches, so it
//! runs first (longest emission wavelength first, to minimise cross-bleaching
//! of channels with shorter or overlapping emission), electron-beam passes
//! run late, and the overlay alignment pass always runs last. The weights
//! below encode that policy; higher weight means earlier acquisition.

use super::{Band, Stream, StreamKind, StreamRef};
use std::cmp::Ordering;
use tracing::warn;

const WEIGHT_FLUORESCENCE: f64 = 100.0;
const WEIGHT_OPTICAL: f64 = 90.0;
const WEIGHT_TIME_CORRELATED: f64 = 85.0;
const WEIGHT_ELECTRON_BEAM: f64 = 50.0;
const WEIGHT_SCANNED_MULTI_DETECTOR: f64 = 40.0;
const WEIGHT_OVERLAY: f64 = 10.0;
const WEIGHT_UNKNOWN: f64 = 0.0;

/// Excitation-based fallback adds roughly the Stokes shift to guess where
/// the emission centre would be.
const STOKES_SHIFT_GUESS_M: f64 = 50e-9;

/// Priority weight of a stream; higher runs earlier.
///
/// Folded combined streams weigh as their first member.
pub fn weight(stream: &dyn Stream) -> f64 {
    if let Some(members) = stream.members() {
        if let Some(first) = members.first() {
            return weight(first.as_ref());
        }
    }

    match stream.kind() {
        StreamKind::Fluorescence {
            emission,
            excitation,
            ..
        } => WEIGHT_FLUORESCENCE + emission_bonus(stream.name(), &emission, &excitation),
        StreamKind::Optical => WEIGHT_OPTICAL,
        StreamKind::TimeCorrelated => WEIGHT_TIME_CORRELATED,
        StreamKind::ElectronBeam => WEIGHT_ELECTRON_BEAM,
        StreamKind::ScannedMultiDetector => WEIGHT_SCANNED_MULTI_DETECTOR,
        StreamKind::Overlay => WEIGHT_OVERLAY,
        StreamKind::Unknown => {
            warn!(
                stream = stream.name(),
                "stream kind not recognized, scheduling it last"
            );
            WEIGHT_UNKNOWN
        }
    }
}

/// Wavelength bonus in micrometres, so a full fluorescence spectrum maps
/// into (0, 1) and never crosses into the next weight class.
///
/// Fallback chain for multi-band filters: emission centre, then excitation
/// centre plus a Stokes-shift guess, then the first listed interval. The
/// last resort is an arbitrary but deterministic pick; its exact value is
/// not load-bearing.
fn emission_bonus(name: &str, emission: &Band, excitation: &Band) -> f64 {
    if let Some(center) = emission.center() {
        return center * 1e6;
    }
    if let Some(center) = excitation.center() {
        return (center + STOKES_SHIFT_GUESS_M) * 1e6;
    }
    warn!(
        stream = name,
        "multi-band emission and excitation, falling back to first interval"
    );
    if let Some(center) = emission.first_center() {
        return center * 1e6;
    }
    if let Some(center) = excitation.first_center() {
        return (center + STOKES_SHIFT_GUESS_M) * 1e6;
    }
    0.0
}

/// Sort streams into acquisition order: descending weight, stable for equal
/// weights (input order preserved).
pub fn sort_streams(streams: &[StreamRef]) -> Vec<StreamRef> {
    let mut keyed: Vec<(f64, StreamRef)> = streams
        .iter()
        .map(|s| (weight(s.as_ref()), s.clone()))
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStream;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fluo(name: &str, emission_nm: f64) -> StreamRef {
        Arc::new(MockStream::new(
            name,
            StreamKind::Fluorescence {
                emission: Band::single((emission_nm - 10.0) * 1e-9, (emission_nm + 10.0) * 1e-9),
                excitation: Band::single(480e-9, 500e-9),
                scanned: false,
            },
        ))
    }

    #[test]
    fn test_class_ordering() {
        let streams: Vec<StreamRef> = vec![
            Arc::new(MockStream::new("overlay", StreamKind::Overlay)),
            Arc::new(MockStream::new("sem", StreamKind::ElectronBeam)),
            fluo("fluo-650", 650.0),
            Arc::new(MockStream::new("bright", StreamKind::Optical)),
        ];
        let sorted = sort_streams(&streams);
        let names: Vec<&str> = sorted.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["fluo-650", "bright", "sem", "overlay"]);
    }

    #[test]
    fn test_longer_emission_runs_first() {
        let sorted = sort_streams(&[fluo("red", 650.0), fluo("green", 520.0)]);
        assert_eq!(sorted[0].name(), "red");
        assert_eq!(sorted[1].name(), "green");
    }

    #[test]
    fn test_weights_non_increasing_and_stable() {
        let streams: Vec<StreamRef> = vec![
            Arc::new(MockStream::new("em-a", StreamKind::ElectronBeam)),
            fluo("fluo", 600.0),
            Arc::new(MockStream::new("em-b", StreamKind::ElectronBeam)),
        ];
        let sorted = sort_streams(&streams);
        let weights: Vec<f64> = sorted.iter().map(|s| weight(s.as_ref())).collect();
        assert!(weights.windows(2).all(|w| w[0] >= w[1]));
        // Equal-weight streams keep their input order.
        assert_eq!(sorted[1].name(), "em-a");
        assert_eq!(sorted[2].name(), "em-b");
    }

    #[test]
    fn test_multiband_fallback_is_deterministic() {
        let multiband = |name: &str| -> StreamRef {
            Arc::new(MockStream::new(
                name,
                StreamKind::Fluorescence {
                    emission: Band::multi(vec![(500e-9, 520e-9), (600e-9, 620e-9)]),
                    excitation: Band::multi(vec![(400e-9, 410e-9), (450e-9, 460e-9)]),
                    scanned: false,
                },
            ))
        };
        // Any stable choice is accepted; the same inputs must weigh the same.
        let a = weight(multiband("a").as_ref());
        let b = weight(multiband("b").as_ref());
        assert_eq!(a, b);
        assert!(a >= WEIGHT_FLUORESCENCE);
    }

    #[traced_test]
    #[test]
    fn test_unknown_kind_is_logged() {
        let unknown: StreamRef = Arc::new(MockStream::new("mystery", StreamKind::Unknown));
        assert_eq!(weight(unknown.as_ref()), 0.0);
        assert!(logs_contain("stream kind not recognized"));
    }
}
