//! Folding compatible streams into combined multi-channel units.
//!
//! Scanned fluorescence channels that share the same physical scanner and the
//! same excitation setting can be driven by one pass of the hardware, so they
//! are grouped into a single [`CombinedStream`]. Time-correlated streams get
//! their own combined wrapper (one each, never grouped). Everything else
//! passes through untouched.
//!
//! Consumers may hold on to a combined stream instance (for example to watch
//! its progress), so [`fold`] reuses a previously built instance whenever an
//! equal member set is found in `reuse` instead of constructing a new one.

use super::{excitation_of, same_stream, Band, Focuser, Leech, Stream, StreamKind, StreamRef};
use super::{ProgressUpdate, SubFuture};
use crate::data::RawResult;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Fold `streams` into acquisition units, reusing combined instances from
/// `reuse` when their member sets match.
///
/// The output order is not significant; callers sort by weight afterwards.
pub fn fold(streams: &[StreamRef], reuse: &[StreamRef]) -> Vec<StreamRef> {
    let mut out: Vec<StreamRef> = Vec::new();
    // Group key is (scanner identity, excitation); linear scan keeps the
    // float-carrying Band out of a hash key.
    let mut groups: Vec<(String, Band, Vec<StreamRef>)> = Vec::new();

    for stream in streams {
        match stream.kind() {
            StreamKind::Fluorescence { scanned: true, .. } => {
                let excitation = excitation_of(stream.as_ref()).unwrap_or_else(Band::empty);
                match stream.emitter_id() {
                    Some(emitter) => {
                        let found = groups
                            .iter()
                            .position(|(id, exc, _)| *id == emitter && *exc == excitation);
                        match found {
                            Some(i) => groups[i].2.push(stream.clone()),
                            None => groups.push((emitter, excitation, vec![stream.clone()])),
                        }
                    }
                    // No scanner identity means no provable hardware sharing;
                    // the stream still becomes its own combined unit.
                    None => out.push(reuse_or_combine(vec![stream.clone()], reuse)),
                }
            }
            StreamKind::TimeCorrelated => {
                out.push(reuse_or_combine(vec![stream.clone()], reuse));
            }
            _ => out.push(stream.clone()),
        }
    }

    for (emitter, _, members) in groups {
        debug!(
            emitter = emitter.as_str(),
            channels = members.len(),
            "folding scanned fluorescence channels"
        );
        out.push(reuse_or_combine(members, reuse));
    }

    out
}

fn reuse_or_combine(members: Vec<StreamRef>, reuse: &[StreamRef]) -> StreamRef {
    for candidate in reuse {
        if let Some(existing) = candidate.members() {
            if member_sets_equal(&existing, &members) {
                debug!(stream = candidate.name(), "reusing folded stream");
                return candidate.clone();
            }
        }
    }
    Arc::new(CombinedStream::new(members)) as StreamRef
}

fn member_sets_equal(a: &[StreamRef], b: &[StreamRef]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| same_stream(x, y)))
}

/// Several member streams acquired as one unit over shared hardware.
///
/// Members are acquired back to back by one handle; the combined result is
/// the concatenation of the member results in member order.
pub struct CombinedStream {
    name: String,
    members: Vec<StreamRef>,
}

impl CombinedStream {
    /// Combine `members` into one acquisition unit. `members` must not be
    /// empty.
    pub fn new(members: Vec<StreamRef>) -> Self {
        debug_assert!(!members.is_empty());
        let name = members
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { name, members }
    }
}

impl Stream for CombinedStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StreamKind {
        self.members
            .first()
            .map(|m| m.kind())
            .unwrap_or(StreamKind::Unknown)
    }

    fn estimate_acquisition_time(&self) -> f64 {
        // One shared pass drives all channels, so the slowest member bounds
        // the unit.
        self.members
            .iter()
            .map(|m| m.estimate_acquisition_time())
            .fold(0.0, f64::max)
    }

    fn acquire(&self) -> Arc<dyn SubFuture> {
        Arc::new(CombinedSubFuture {
            members: self.members.clone(),
            cancelled: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    fn leeches(&self) -> Vec<Arc<dyn Leech>> {
        self.members.iter().flat_map(|m| m.leeches()).collect()
    }

    fn focuser(&self) -> Option<Arc<dyn Focuser>> {
        self.members.iter().find_map(|m| m.focuser())
    }

    fn emitter_id(&self) -> Option<String> {
        self.members.first().and_then(|m| m.emitter_id())
    }

    fn embed_settings(&self) -> bool {
        self.members.iter().any(|m| m.embed_settings())
    }

    fn raw(&self) -> Vec<RawResult> {
        self.members.iter().flat_map(|m| m.raw()).collect()
    }

    fn members(&self) -> Option<Vec<StreamRef>> {
        Some(self.members.clone())
    }
}

struct CombinedSubFuture {
    members: Vec<StreamRef>,
    cancelled: AtomicBool,
    current: Mutex<Option<Arc<dyn SubFuture>>>,
}

impl CombinedSubFuture {
    fn set_current(&self, handle: Option<Arc<dyn SubFuture>>) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = handle;
        }
    }
}

#[async_trait]
impl SubFuture for CombinedSubFuture {
    async fn result(&self) -> Result<Vec<RawResult>> {
        let mut all = Vec::new();
        for member in &self.members {
            if self.cancelled.load(Ordering::SeqCst) {
                bail!("combined acquisition cancelled");
            }
            let handle = member.acquire();
            self.set_current(Some(handle.clone()));
            let raws = handle.result().await;
            self.set_current(None);
            all.extend(raws?);
        }
        Ok(all)
    }

    fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.current.lock() {
            Ok(guard) => guard.as_ref().map(|h| h.cancel()).unwrap_or(true),
            Err(_) => false,
        }
    }

    fn progress(&self) -> Option<watch::Receiver<ProgressUpdate>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStream;

    fn scanned_fluo(name: &str, emitter: &str, excitation_nm: f64) -> StreamRef {
        Arc::new(
            MockStream::new(
                name,
                StreamKind::Fluorescence {
                    emission: Band::single(600e-9, 700e-9),
                    excitation: Band::single(excitation_nm * 1e-9, (excitation_nm + 20.0) * 1e-9),
                    scanned: true,
                },
            )
            .with_emitter(emitter),
        )
    }

    #[test]
    fn test_groups_by_emitter_and_excitation() {
        let a = scanned_fluo("a", "scanner-1", 480.0);
        let b = scanned_fluo("b", "scanner-1", 480.0);
        let c = scanned_fluo("c", "scanner-1", 560.0);
        let d = scanned_fluo("d", "scanner-2", 480.0);
        let em: StreamRef = Arc::new(MockStream::new("sem", StreamKind::ElectronBeam));

        let folded = fold(&[a, b, c, d, em], &[]);
        // sem passes through, a+b merge, c and d stay separate units.
        assert_eq!(folded.len(), 4);
        let combined: Vec<_> = folded.iter().filter(|s| s.members().is_some()).collect();
        assert_eq!(combined.len(), 3);
        assert!(combined
            .iter()
            .any(|s| s.members().map(|m| m.len()) == Some(2)));
    }

    #[test]
    fn test_time_correlated_wrapped_individually() {
        let flim_a: StreamRef = Arc::new(MockStream::new("flim-a", StreamKind::TimeCorrelated));
        let flim_b: StreamRef = Arc::new(MockStream::new("flim-b", StreamKind::TimeCorrelated));
        let folded = fold(&[flim_a, flim_b], &[]);
        assert_eq!(folded.len(), 2);
        for stream in &folded {
            assert_eq!(stream.members().map(|m| m.len()), Some(1));
        }
    }

    #[test]
    fn test_reuse_preserves_instances() {
        let a = scanned_fluo("a", "scanner-1", 480.0);
        let b = scanned_fluo("b", "scanner-1", 480.0);
        let streams = vec![a, b];

        let first = fold(&streams, &[]);
        let second = fold(&streams, &first);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert!(same_stream(&first[0], &second[0]));
    }

    #[test]
    fn test_non_foldable_pass_through_unmodified() {
        let em: StreamRef = Arc::new(MockStream::new("sem", StreamKind::ElectronBeam));
        let overlay: StreamRef = Arc::new(MockStream::new("overlay", StreamKind::Overlay));
        let folded = fold(&[em.clone(), overlay.clone()], &[]);
        assert_eq!(folded.len(), 2);
        assert!(folded.iter().any(|s| same_stream(s, &em)));
        assert!(folded.iter().any(|s| same_stream(s, &overlay)));
    }

    #[tokio::test]
    async fn test_combined_acquisition_concatenates_members() {
        let a = Arc::new(
            MockStream::new(
                "a",
                StreamKind::Fluorescence {
                    emission: Band::single(600e-9, 700e-9),
                    excitation: Band::single(480e-9, 500e-9),
                    scanned: true,
                },
            )
            .with_results(2),
        ) as StreamRef;
        let b = Arc::new(MockStream::new("b", StreamKind::TimeCorrelated).with_results(1))
            as StreamRef;

        let combined = CombinedStream::new(vec![a, b]);
        let raws = combined.acquire().result().await.unwrap();
        assert_eq!(raws.len(), 3);
    }
}
