//! Post-acquisition metadata reconciliation.
//!
//! The overlay pass produces no user-visible data; its two raw outputs carry
//! fine-alignment corrections for the optical and electron data of the same
//! series. Reconciliation propagates those corrections into the sibling
//! results, drops the overlay entry, and stamps a description on every
//! result that lacks one. Pure in/out: the collected results go in, the
//! reconciled results come out, nothing is shared.

use crate::data::RawResult;
use crate::metadata::{merge_missing, MetadataKey, MetadataMap};
use crate::stream::{Stream, StreamKind, StreamRef};
use tracing::warn;

/// Reconcile the per-stream result lists of one series.
pub fn reconcile(
    mut results: Vec<(StreamRef, Vec<RawResult>)>,
) -> Vec<(StreamRef, Vec<RawResult>)> {
    let overlay_indices: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, (stream, _))| matches!(stream.kind(), StreamKind::Overlay))
        .map(|(i, _)| i)
        .collect();
    if overlay_indices.len() > 1 {
        warn!(
            count = overlay_indices.len(),
            "multiple overlay streams in one series, using the last"
        );
    }

    let mut optical_correction = MetadataMap::new();
    let mut electron_correction = MetadataMap::new();
    if let Some(&index) = overlay_indices.last() {
        let (stream, raws) = &results[index];
        if raws.len() >= 2 {
            if let Some(value) = raws[0].metadata.get(&MetadataKey::CorrectionOptical) {
                optical_correction.insert(MetadataKey::CorrectionOptical, value.clone());
            }
            if let Some(value) = raws[1].metadata.get(&MetadataKey::CorrectionElectron) {
                electron_correction.insert(MetadataKey::CorrectionElectron, value.clone());
            }
            if optical_correction.is_empty() || electron_correction.is_empty() {
                warn!(
                    stream = stream.name(),
                    "overlay output carries no correction metadata"
                );
            }
        } else {
            warn!(
                stream = stream.name(),
                results = raws.len(),
                "overlay produced too few results, alignment correction unavailable"
            );
        }
        // The overlay's own output is never returned to the caller.
        results.remove(index);
    }

    for (stream, raws) in &mut results {
        let kind = stream.kind();
        if kind.is_optical_class() && !optical_correction.is_empty() {
            for raw in raws.iter_mut() {
                merge_missing(&mut raw.metadata, &optical_correction);
            }
        } else if kind.is_electron_class() && !electron_correction.is_empty() {
            for raw in raws.iter_mut() {
                merge_missing(&mut raw.metadata, &electron_correction);
            }
        }
        for raw in raws.iter_mut() {
            raw.describe_if_missing(stream.name());
        }
    }

    results
}
