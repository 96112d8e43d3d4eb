//! Metadata key namespace and pure merge helpers.
//!
//! Acquired results carry a key/value metadata map. The key namespace is a
//! closed enum with stable string forms so that downstream consumers (and
//! serialized output) can rely on the identifiers never changing. Merging is
//! done through pure functions that take and return owned maps; there is no
//! shared mutable metadata state anywhere in the crate.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stable identifiers for result metadata entries.
///
/// The serialized string forms are part of the crate's public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    /// Timestamp of the acquisition, RFC 3339.
    #[serde(rename = "acquisition-date")]
    AcquisitionDate,
    /// Human-readable description of the result.
    #[serde(rename = "description")]
    Description,
    /// Deep-copied hardware settings snapshot taken at acquisition time.
    #[serde(rename = "extra-settings")]
    ExtraSettings,
    /// Fine-alignment correction for optical-class data, produced by the
    /// overlay pass.
    #[serde(rename = "correction-optical")]
    CorrectionOptical,
    /// Fine-alignment correction for electron-class data, produced by the
    /// overlay pass.
    #[serde(rename = "correction-electron")]
    CorrectionElectron,
    /// Ordered Z positions (metres) of the slices in a Z-cube result.
    #[serde(rename = "z-positions")]
    ZPositions,
}

impl MetadataKey {
    /// Stable string form of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::AcquisitionDate => "acquisition-date",
            MetadataKey::Description => "description",
            MetadataKey::ExtraSettings => "extra-settings",
            MetadataKey::CorrectionOptical => "correction-optical",
            MetadataKey::CorrectionElectron => "correction-electron",
            MetadataKey::ZPositions => "z-positions",
        }
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a single acquired result.
pub type MetadataMap = HashMap<MetadataKey, Value>;

/// Merge `source` into `target`, keeping any value already present in
/// `target`. Returns the number of keys that were actually inserted.
pub fn merge_missing(target: &mut MetadataMap, source: &MetadataMap) -> usize {
    let mut inserted = 0;
    for (key, value) in source {
        target.entry(*key).or_insert_with(|| {
            inserted += 1;
            value.clone()
        });
    }
    inserted
}

/// Current time in the form stored under [`MetadataKey::AcquisitionDate`].
pub fn acquisition_date_now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stable_string_forms() {
        assert_eq!(MetadataKey::AcquisitionDate.as_str(), "acquisition-date");
        assert_eq!(MetadataKey::CorrectionOptical.as_str(), "correction-optical");
        let serialized = serde_json::to_string(&MetadataKey::ZPositions).unwrap();
        assert_eq!(serialized, "\"z-positions\"");
    }

    #[test]
    fn test_merge_keeps_existing_values() {
        let mut target = MetadataMap::new();
        target.insert(MetadataKey::Description, json!("existing"));

        let mut source = MetadataMap::new();
        source.insert(MetadataKey::Description, json!("incoming"));
        source.insert(MetadataKey::CorrectionOptical, json!({"shift": [1.0, 2.0]}));

        let inserted = merge_missing(&mut target, &source);
        assert_eq!(inserted, 1);
        assert_eq!(target[&MetadataKey::Description], json!("existing"));
        assert_eq!(
            target[&MetadataKey::CorrectionOptical],
            json!({"shift": [1.0, 2.0]})
        );
    }
}
