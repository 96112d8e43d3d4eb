//! Raw acquisition results.
//!
//! A [`RawResult`] is the opaque payload produced by one stream acquisition:
//! an array of detector counts, its shape, and a metadata map. Results are
//! owned values; the task owns them between acquisition and hand-off to the
//! caller, and nothing in the crate keeps references into them afterwards.

use crate::metadata::{acquisition_date_now, MetadataKey, MetadataMap};
use serde::Serialize;
use serde_json::Value;

/// One acquired data array plus its metadata.
///
/// `shape` is row-major; a plain image is 2-D and an assembled Z-cube is 3-D
/// with the Z axis first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawResult {
    /// Detector counts, flattened row-major.
    pub data: Vec<u16>,
    /// Dimensions of `data`.
    pub shape: Vec<usize>,
    /// Key/value metadata attached to this result.
    pub metadata: MetadataMap,
}

impl RawResult {
    /// Create a result stamped with the current acquisition date.
    pub fn new(data: Vec<u16>, shape: Vec<usize>) -> Self {
        let mut metadata = MetadataMap::new();
        metadata.insert(MetadataKey::AcquisitionDate, acquisition_date_now());
        Self {
            data,
            shape,
            metadata,
        }
    }

    /// Attach or replace a metadata entry, builder-style.
    pub fn with_metadata(mut self, key: MetadataKey, value: Value) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// The human-readable description, if one has been stamped.
    pub fn description(&self) -> Option<&str> {
        self.metadata
            .get(&MetadataKey::Description)
            .and_then(Value::as_str)
    }

    /// Stamp `description` only if none is present yet.
    pub fn describe_if_missing(&mut self, description: &str) {
        self.metadata
            .entry(MetadataKey::Description)
            .or_insert_with(|| Value::String(description.to_string()));
    }

    /// Number of elements in the payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
