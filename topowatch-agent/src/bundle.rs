//! Probe bundle: a managed set of probe and target handlers
//!
//! Bulk operations attempt every handler: one failure never prevents the
//! others from starting or stopping. Handlers run their start/stop
//! concurrently; operations on the same id are serialized by a per-slot lock.

use crate::capability::{CapabilityKind, CapabilityRegistry};
use crate::error::ProbeError;
use crate::handler::{ProbeContext, ProbeHandler};
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-handler result of a bulk operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Started,
    Stopped,
    /// Never constructed, nothing to stop
    Skipped,
    Failed(ProbeError),
}

/// Outcome of every handler, in bundle order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleReport {
    pub outcomes: Vec<(String, HandlerOutcome)>,
}

impl BundleReport {
    pub fn outcome(&self, id: &str) -> Option<&HandlerOutcome> {
        self.outcomes
            .iter()
            .find(|(slot_id, _)| slot_id == id)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProbeError)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            HandlerOutcome::Failed(e) => Some((id.as_str(), e)),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

struct Slot {
    id: String,
    kind: CapabilityKind,
    /// Construction failures are kept so bulk reports can name them
    handler: Result<Arc<dyn ProbeHandler>, ProbeError>,
    guard: tokio::sync::Mutex<()>,
}

#[derive(Default)]
pub struct ProbeBundle {
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl ProbeBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constructed, not yet started handler
    pub fn add(&self, id: &str, handler: Box<dyn ProbeHandler>) -> Result<(), ProbeError> {
        let kind = handler.kind().clone();
        self.insert(Slot {
            id: id.to_string(),
            kind,
            handler: Ok(Arc::from(handler)),
            guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Construct `kind` through `registry` and add it under `id`.
    ///
    /// A construction failure is returned to the caller and also kept in the
    /// bundle as an inactive slot, reported as failed by [`start_all`].
    ///
    /// [`start_all`]: ProbeBundle::start_all
    pub fn add_kind(
        &self,
        registry: &CapabilityRegistry,
        id: &str,
        kind: &str,
        ctx: ProbeContext,
    ) -> Result<(), ProbeError> {
        if self.contains(id) {
            return Err(ProbeError::DuplicateId(id.to_string()));
        }

        let handler: Result<Arc<dyn ProbeHandler>, ProbeError> =
            registry.construct(kind, ctx).map(Arc::from);
        let constructed = handler.as_ref().map(|_| ()).map_err(Clone::clone);
        if let Err(e) = &constructed {
            warn!("Handler {} ({}) inactive: {}", id, kind, e);
        }

        self.insert(Slot {
            id: id.to_string(),
            kind: CapabilityKind::new(kind),
            handler,
            guard: tokio::sync::Mutex::new(()),
        })?;
        constructed
    }

    /// Stop the handler if it is running and evict it
    pub async fn remove(&self, id: &str) -> Result<(), ProbeError> {
        let slot = {
            let mut slots = self.lock();
            let index = slots
                .iter()
                .position(|slot| slot.id == id)
                .ok_or_else(|| ProbeError::NotFound(id.to_string()))?;
            slots.remove(index)
        };

        let _guard = slot.guard.lock().await;
        if let Ok(handler) = &slot.handler {
            handler.stop().await;
        }
        debug!("Handler {} removed", id);
        Ok(())
    }

    /// Start every handler, reporting each outcome
    pub async fn start_all(&self) -> BundleReport {
        let slots = self.snapshot();
        let outcomes = join_all(slots.iter().map(|slot| async move {
            let outcome = match &slot.handler {
                Err(e) => HandlerOutcome::Failed(e.clone()),
                Ok(handler) => {
                    let _guard = slot.guard.lock().await;
                    match handler.start().await {
                        Ok(()) => {
                            info!("Handler {} ({}) started", slot.id, slot.kind);
                            HandlerOutcome::Started
                        }
                        Err(e) => {
                            warn!("Handler {} ({}) failed to start: {}", slot.id, slot.kind, e);
                            HandlerOutcome::Failed(e)
                        }
                    }
                }
            };
            (slot.id.clone(), outcome)
        }))
        .await;

        BundleReport { outcomes }
    }

    /// Stop every handler. Returns once every stop has completed.
    pub async fn stop_all(&self) -> BundleReport {
        let slots = self.snapshot();
        let outcomes = join_all(slots.iter().map(|slot| async move {
            let outcome = match &slot.handler {
                Err(_) => HandlerOutcome::Skipped,
                Ok(handler) => {
                    let _guard = slot.guard.lock().await;
                    handler.stop().await;
                    debug!("Handler {} ({}) stopped", slot.id, slot.kind);
                    HandlerOutcome::Stopped
                }
            };
            (slot.id.clone(), outcome)
        }))
        .await;

        BundleReport { outcomes }
    }

    /// Direct access to a handler, e.g. to feed packets to a flow target
    /// without going through the bundle's locks
    pub fn handler(&self, id: &str) -> Option<Arc<dyn ProbeHandler>> {
        self.lock()
            .iter()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.handler.as_ref().ok().cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().iter().any(|slot| slot.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|slot| slot.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, slot: Slot) -> Result<(), ProbeError> {
        let mut slots = self.lock();
        if slots.iter().any(|s| s.id == slot.id) {
            return Err(ProbeError::DuplicateId(slot.id));
        }
        slots.push(Arc::new(slot));
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Lifecycle, Transition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct FakeProbe {
        kind: CapabilityKind,
        fail_start: bool,
        calls: Arc<Calls>,
        lifecycle: Lifecycle,
    }

    fn fake(fail_start: bool) -> (Box<dyn ProbeHandler>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let probe = FakeProbe {
            kind: CapabilityKind::new("fake"),
            fail_start,
            calls: calls.clone(),
            lifecycle: Lifecycle::new(),
        };
        (Box::new(probe), calls)
    }

    #[async_trait]
    impl ProbeHandler for FakeProbe {
        fn kind(&self) -> &CapabilityKind {
            &self.kind
        }

        async fn start(&self) -> Result<(), ProbeError> {
            match self.lifecycle.begin_start() {
                Transition::Proceed => {}
                Transition::Noop => return Ok(()),
                Transition::Rejected => {
                    return Err(ProbeError::AlreadyStopped {
                        kind: "fake".to_string(),
                    })
                }
            }
            self.calls.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(ProbeError::start("fake", "boom"));
            }
            self.lifecycle.mark_running();
            Ok(())
        }

        async fn stop(&self) {
            if self.lifecycle.begin_stop() == Transition::Proceed {
                self.calls.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let bundle = ProbeBundle::new();
        bundle.add("a", fake(false).0).unwrap();
        let err = bundle.add("a", fake(false).0).unwrap_err();
        assert_eq!(err, ProbeError::DuplicateId("a".to_string()));
        assert_eq!(bundle.len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_does_not_abort_siblings() {
        let bundle = ProbeBundle::new();
        let (first, first_calls) = fake(true);
        let (second, second_calls) = fake(false);
        bundle.add("first", first).unwrap();
        bundle.add("second", second).unwrap();

        let report = bundle.start_all().await;

        assert!(!report.is_success());
        assert!(matches!(report.outcome("first"), Some(HandlerOutcome::Failed(_))));
        assert_eq!(report.outcome("second"), Some(&HandlerOutcome::Started));
        assert_eq!(first_calls.starts.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let bundle = ProbeBundle::new();
        bundle.add("a", fake(false).0).unwrap();
        bundle.add("b", fake(true).0).unwrap();
        bundle.start_all().await;

        let first = bundle.stop_all().await;
        let second = bundle.stop_all().await;

        assert!(first.is_success());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_remove_stops_and_evicts() {
        let bundle = ProbeBundle::new();
        let (probe, calls) = fake(false);
        bundle.add("a", probe).unwrap();
        bundle.start_all().await;

        bundle.remove("a").await.unwrap();

        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert!(bundle.is_empty());
        assert_eq!(
            bundle.remove("a").await.unwrap_err(),
            ProbeError::NotFound("a".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_and_remove_on_same_id() {
        for _ in 0..50 {
            let bundle = Arc::new(ProbeBundle::new());
            let (probe, calls) = fake(false);
            bundle.add("a", probe).unwrap();

            let starter = tokio::spawn({
                let bundle = bundle.clone();
                async move { bundle.start_all().await }
            });
            let remover = tokio::spawn({
                let bundle = bundle.clone();
                async move { bundle.remove("a").await }
            });
            let report = starter.await.unwrap();
            remover.await.unwrap().unwrap();

            let starts = calls.starts.load(Ordering::SeqCst);
            let stops = calls.stops.load(Ordering::SeqCst);
            assert!(starts <= 1, "started {} times", starts);
            // Whatever got started was stopped by the removal
            assert_eq!(starts, stops);
            assert!(bundle.is_empty());
            match report.outcome("a") {
                Some(HandlerOutcome::Started) => assert_eq!(starts, 1),
                Some(HandlerOutcome::Failed(ProbeError::AlreadyStopped { .. })) => {
                    assert_eq!(starts, 0)
                }
                None => assert_eq!(starts, 0),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }
}
