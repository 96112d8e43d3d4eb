//! Hardware settings snapshot collection.
//!
//! A [`SettingsObserver`] passively watches every tunable parameter of a
//! fixed set of hardware components and produces an immutable deep-copy
//! snapshot on demand. The snapshot is stamped into result metadata so every
//! acquired image records the hardware state it was taken with.
//!
//! Parameters are observed through `tokio::sync::watch` channels: the
//! hardware side replaces the value, the observer side reads the latest
//! value at snapshot time. Only whole-value replacement ever happens under
//! contention, so no additional locking is needed here. Each subscription is
//! held by a small observer struct that carries the component and parameter
//! names as explicit fields.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Parameters that never affect acquisition semantics and are skipped when
/// observing a component.
static IGNORED_PARAMETERS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["children", "dependencies", "alive", "state"]));

/// Subscription handle for one tunable parameter, as exposed by a component.
pub struct ParameterHandle {
    /// Parameter name.
    pub name: String,
    /// Physical unit, if any.
    pub unit: Option<String>,
    /// Live value subscription.
    pub rx: watch::Receiver<Value>,
}

/// A hardware component exposing tunable parameters.
pub trait Component: Send + Sync {
    /// Component name, used as the snapshot's outer key.
    fn name(&self) -> &str;

    /// Subscription handles for all tunable parameters.
    fn parameters(&self) -> Vec<ParameterHandle>;
}

/// One observed parameter: explicit component/parameter naming plus the live
/// subscription.
struct ParameterObserver {
    component: String,
    parameter: String,
    unit: Option<String>,
    rx: watch::Receiver<Value>,
}

/// Recorded value and unit of one parameter at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingEntry {
    /// Parameter value.
    pub value: Value,
    /// Physical unit, if any.
    pub unit: Option<String>,
}

/// Snapshot shape: component name -> parameter name -> entry.
pub type SettingsSnapshot = HashMap<String, HashMap<String, SettingEntry>>;

/// Passive observer over a fixed component set.
pub struct SettingsObserver {
    observers: Vec<ParameterObserver>,
}

impl SettingsObserver {
    /// Observe every tunable parameter of `components`, minus the built-in
    /// denylist.
    pub fn new(components: &[Arc<dyn Component>]) -> Self {
        Self::with_ignored(components, &[])
    }

    /// Like [`SettingsObserver::new`], with extra parameter names to skip on
    /// top of the built-in denylist.
    pub fn with_ignored(components: &[Arc<dyn Component>], extra_ignored: &[String]) -> Self {
        let mut observers = Vec::new();
        for component in components {
            for handle in component.parameters() {
                if IGNORED_PARAMETERS.contains(handle.name.as_str())
                    || extra_ignored.iter().any(|p| *p == handle.name)
                {
                    continue;
                }
                observers.push(ParameterObserver {
                    component: component.name().to_string(),
                    parameter: handle.name,
                    unit: handle.unit,
                    rx: handle.rx,
                });
            }
        }
        debug!(parameters = observers.len(), "observing hardware settings");
        Self { observers }
    }

    /// Deep-copied snapshot of all observed parameters.
    ///
    /// The returned map shares nothing with live state; callers may stash it
    /// in result metadata without risk of later mutation.
    pub fn all_settings(&self) -> SettingsSnapshot {
        let mut snapshot = SettingsSnapshot::new();
        for observer in &self.observers {
            let value = observer.rx.borrow().clone();
            snapshot
                .entry(observer.component.clone())
                .or_default()
                .insert(
                    observer.parameter.clone(),
                    SettingEntry {
                        value,
                        unit: observer.unit.clone(),
                    },
                );
        }
        snapshot
    }

    /// Number of observed parameters.
    pub fn observed_count(&self) -> usize {
        self.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockComponent;
    use serde_json::json;

    fn camera() -> Arc<MockComponent> {
        Arc::new(
            MockComponent::new("camera")
                .with_parameter("exposure", Some("s"), json!(0.1))
                .with_parameter("binning", None, json!([2, 2]))
                .with_parameter("state", None, json!("running"))
                .with_parameter("children", None, json!([])),
        )
    }

    #[test]
    fn test_denylist_is_skipped() {
        let cam = camera();
        let observer = SettingsObserver::new(&[cam.clone() as Arc<dyn Component>]);
        assert_eq!(observer.observed_count(), 2);
        let snapshot = observer.all_settings();
        let params = &snapshot["camera"];
        assert!(params.contains_key("exposure"));
        assert!(!params.contains_key("state"));
        assert!(!params.contains_key("children"));
    }

    #[test]
    fn test_extra_ignored_parameters() {
        let cam = camera();
        let observer = SettingsObserver::with_ignored(
            &[cam as Arc<dyn Component>],
            &["binning".to_string()],
        );
        assert_eq!(observer.observed_count(), 1);
    }

    #[test]
    fn test_snapshot_is_not_a_live_alias() {
        let cam = camera();
        let observer = SettingsObserver::new(&[cam.clone() as Arc<dyn Component>]);

        let stale = observer.all_settings();
        cam.set("exposure", json!(0.25)).unwrap();
        let fresh = observer.all_settings();

        assert_eq!(stale["camera"]["exposure"].value, json!(0.1));
        assert_eq!(fresh["camera"]["exposure"].value, json!(0.25));
        assert_eq!(fresh["camera"]["exposure"].unit.as_deref(), Some("s"));
    }
}
