//! Probe and target handler contracts

use crate::capability::CapabilityKind;
use crate::error::ProbeError;
use crate::graph::{Graph, NodeKey};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use topowatch_common::Capture;

/// Everything a constructor may need to build a handler
#[derive(Clone)]
pub struct ProbeContext {
    pub graph: Arc<dyn Graph>,
    /// Node representing the local host; topology probes hang their nodes off it
    pub host: NodeKey,
    /// Capture specification, for flow targets
    pub capture: Option<Capture>,
    /// Capability-specific options
    pub options: serde_json::Value,
}

impl ProbeContext {
    pub fn new(graph: Arc<dyn Graph>, host: NodeKey) -> Self {
        Self {
            graph,
            host,
            capture: None,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the options into a capability's own config type.
    /// Missing options yield the type's defaults.
    pub fn options<T>(&self, kind: &str) -> Result<T, ProbeError>
    where
        T: DeserializeOwned + Default,
    {
        if self.options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.options.clone()).map_err(|e| ProbeError::InvalidOptions {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A pluggable unit of observation with a start/stop lifecycle.
///
/// Both operations take `&self` so a running target can keep receiving
/// packets while the owning bundle manages it. `stop` on a handler that was
/// never started, or that is already stopped, is a no-op.
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    fn kind(&self) -> &CapabilityKind;

    async fn start(&self) -> Result<(), ProbeError>;

    async fn stop(&self);

    /// Packet sink view, for flow capture targets
    fn as_target(&self) -> Option<&dyn FlowTarget> {
        None
    }
}

/// Filter context handed over by the capture pipeline
pub trait PacketFilter: Send + Sync {
    fn matches(&self, packet: &[u8]) -> bool;
}

impl<F> PacketFilter for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn matches(&self, packet: &[u8]) -> bool {
        self(packet)
    }
}

/// Counters kept by a flow target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    /// Packets offered while the target was not armed (before start, after
    /// stop, or with its node missing)
    pub inactive: u64,
    pub received: u64,
    pub forwarded: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub send_errors: u64,
}

/// Packet sink fed by an external capture pipeline.
///
/// `receive` never fails: bad or undeliverable packets are dropped and
/// counted in [`TargetStats`].
pub trait FlowTarget: Send + Sync {
    fn receive(&self, packet: &[u8], filter: Option<&dyn PacketFilter>);

    fn stats(&self) -> TargetStats;
}
