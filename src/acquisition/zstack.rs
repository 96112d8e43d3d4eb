//! Z-stack support: level maps, focus-step estimation and Z-cube assembly.
//!
//! Streams listed in a [`ZLevelMap`] with more than one Z position are
//! acquired once per level, with a blocking focuser move before each level.
//! The per-level slices are assembled into one combined 3-D "Z-cube" result
//! so the caller sees a single result where the stream would otherwise have
//! appeared.

use crate::data::RawResult;
use crate::error::{AcqError, AcqResult};
use crate::metadata::MetadataKey;
use crate::stream::{same_stream, Focuser, Stream, StreamRef};
use serde_json::json;
use tracing::warn;

/// Mapping from stream to the ordered Z positions (metres) it should be
/// acquired at.
///
/// Lookup is by stream identity (`Arc` pointer), so the same map can be
/// rebuilt against the same stream instances the caller holds.
#[derive(Default)]
pub struct ZLevelMap {
    entries: Vec<(StreamRef, Vec<f64>)>,
}

impl ZLevelMap {
    /// Empty map: every stream acquires exactly once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Z positions for `stream`, replacing any previous entry.
    pub fn insert(&mut self, stream: StreamRef, levels: Vec<f64>) {
        match self
            .entries
            .iter()
            .position(|(s, _)| same_stream(s, &stream))
        {
            Some(i) => self.entries[i].1 = levels,
            None => self.entries.push((stream, levels)),
        }
    }

    /// Z positions listed for `stream`, if any.
    pub fn levels_for(&self, stream: &StreamRef) -> Option<&[f64]> {
        self.entries
            .iter()
            .find(|(s, _)| same_stream(s, stream))
            .map(|(_, levels)| levels.as_slice())
    }

    /// Number of streams with an entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the map against the stream list it will be used with: every key
    /// must be one of `streams`, list at least one level, and streams with
    /// real Z-stacking must expose a focuser.
    pub(crate) fn validate_against(&self, streams: &[StreamRef]) -> AcqResult<()> {
        for (stream, levels) in &self.entries {
            if !streams.iter().any(|s| same_stream(s, stream)) {
                return Err(AcqError::InvalidZLevels(format!(
                    "stream '{}' is not part of the acquisition",
                    stream.name()
                )));
            }
            if levels.is_empty() {
                return Err(AcqError::InvalidZLevels(format!(
                    "no Z levels listed for stream '{}'",
                    stream.name()
                )));
            }
            if levels.len() > 1 && stream.focuser().is_none() {
                return Err(AcqError::InvalidZLevels(format!(
                    "stream '{}' has multiple Z levels but no focuser",
                    stream.name()
                )));
            }
        }
        Ok(())
    }
}

/// Estimated duration in seconds of one focus step for `stream`, computed
/// from the move between the first two listed levels. Zero when fewer than
/// two levels are listed.
pub(crate) fn focus_step_estimate(stream: &StreamRef, levels: &[f64]) -> f64 {
    if levels.len() < 2 {
        return 0.0;
    }
    stream
        .focuser()
        .map(|f| f.estimate_move_duration(levels[0], levels[1]))
        .unwrap_or(0.0)
}

/// Assemble per-level slices into one Z-cube result.
///
/// The cube's shape is `[levels, slice shape...]`, its metadata is the first
/// slice's metadata plus the ordered Z positions.
pub(crate) fn assemble_z_cube(stream_name: &str, slices: Vec<(f64, RawResult)>) -> RawResult {
    let Some((_, first)) = slices.first() else {
        warn!(stream = stream_name, "assembling empty Z-cube");
        return RawResult::new(Vec::new(), vec![0])
            .with_metadata(MetadataKey::ZPositions, json!([]));
    };

    let slice_shape = first.shape.clone();
    let mut metadata = first.metadata.clone();
    let mut shape = vec![slices.len()];
    shape.extend(&slice_shape);

    let mut positions = Vec::with_capacity(slices.len());
    let mut data = Vec::with_capacity(first.data.len() * slices.len());
    for (z, slice) in slices {
        if slice.shape != slice_shape {
            warn!(
                stream = stream_name,
                "Z slices have mismatched shapes, cube dimensions are nominal"
            );
        }
        positions.push(z);
        data.extend(slice.data);
    }

    metadata.insert(MetadataKey::ZPositions, json!(positions));
    RawResult {
        data,
        shape,
        metadata,
    }
}

/// Total expected duration in seconds of a Z-stack acquisition: each stream
/// contributes its per-acquisition estimate times its level count, plus one
/// focus step per level transition.
pub fn estimate_z_stack_duration(streams: &[StreamRef], z_levels: &ZLevelMap) -> f64 {
    streams
        .iter()
        .map(|stream| {
            let levels = z_levels.levels_for(stream).unwrap_or(&[]);
            let count = levels.len().max(1);
            stream.estimate_acquisition_time() * count as f64
                + focus_step_estimate(stream, levels) * (count - 1) as f64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::{MockFocuser, MockStream};
    use crate::stream::StreamKind;
    use std::sync::Arc;

    fn stacked_stream(name: &str, estimate: f64, speed: f64) -> StreamRef {
        Arc::new(
            MockStream::new(name, StreamKind::Optical)
                .with_estimate(estimate)
                .with_focuser(Arc::new(MockFocuser::new().with_speed(speed))),
        )
    }

    #[test]
    fn test_levels_lookup_by_identity() {
        let a = stacked_stream("a", 1.0, 100e-6);
        let b = stacked_stream("b", 1.0, 100e-6);
        let mut map = ZLevelMap::new();
        map.insert(a.clone(), vec![0.0, 1e-6]);

        assert_eq!(map.levels_for(&a), Some(&[0.0, 1e-6][..]));
        assert!(map.levels_for(&b).is_none());

        map.insert(a.clone(), vec![0.0]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.levels_for(&a), Some(&[0.0][..]));
    }

    #[test]
    fn test_validation() {
        let a = stacked_stream("a", 1.0, 100e-6);
        let orphan = stacked_stream("orphan", 1.0, 100e-6);
        let streams = vec![a.clone()];

        let mut map = ZLevelMap::new();
        map.insert(a.clone(), vec![0.0, 1e-6]);
        assert!(map.validate_against(&streams).is_ok());

        map.insert(orphan, vec![0.0]);
        assert!(matches!(
            map.validate_against(&streams),
            Err(AcqError::InvalidZLevels(_))
        ));

        let mut empty_levels = ZLevelMap::new();
        empty_levels.insert(a.clone(), Vec::new());
        assert!(empty_levels.validate_against(&streams).is_err());

        let bare: StreamRef = Arc::new(MockStream::new("bare", StreamKind::Optical));
        let mut no_focuser = ZLevelMap::new();
        no_focuser.insert(bare.clone(), vec![0.0, 1e-6]);
        assert!(no_focuser.validate_against(&[bare]).is_err());
    }

    #[test]
    fn test_z_cube_assembly() {
        let slices = vec![
            (0.0, RawResult::new(vec![1, 2, 3, 4], vec![2, 2])),
            (1e-6, RawResult::new(vec![5, 6, 7, 8], vec![2, 2])),
            (2e-6, RawResult::new(vec![9, 10, 11, 12], vec![2, 2])),
        ];
        let cube = assemble_z_cube("stack", slices);
        assert_eq!(cube.shape, vec![3, 2, 2]);
        assert_eq!(cube.data.len(), 12);
        assert_eq!(cube.data[4], 5);
        assert_eq!(
            cube.metadata[&MetadataKey::ZPositions],
            json!([0.0, 1e-6, 2e-6])
        );
    }

    #[test]
    fn test_duration_formula() {
        // 2 um step at 100 um/s -> 0.02 s per focus step.
        let stacked = stacked_stream("stack", 1.0, 100e-6);
        let plain: StreamRef = Arc::new(
            MockStream::new("plain", StreamKind::ElectronBeam).with_estimate(0.5),
        );
        let mut map = ZLevelMap::new();
        map.insert(stacked.clone(), vec![0.0, 2e-6, 4e-6]);

        let total = estimate_z_stack_duration(&[stacked, plain], &map);
        // 3 acquisitions + 2 focus steps + 1 plain acquisition.
        assert!((total - (3.0 + 2.0 * 0.02 + 0.5)).abs() < 1e-9);
    }
}
