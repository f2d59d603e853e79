//! Host agent for topowatch
//!
//! Responsibilities:
//! - Register every probe and target capability, supported or not
//! - Build a bundle of topology probes and flow targets from configuration
//! - Mirror host state (host node, network namespaces) into the topology graph
//! - Mirror captured packets to ERSPAN collectors

pub mod agent;
pub mod bundle;
pub mod capability;
pub mod error;
pub mod flow;
pub mod graph;
pub mod handler;
pub mod lifecycle;
pub mod topology;

pub use agent::{Agent, AgentConfig};
pub use bundle::{BundleReport, HandlerOutcome, ProbeBundle};
pub use capability::{CapabilityKind, CapabilityRegistry};
pub use error::ProbeError;
pub use graph::{Graph, MemoryGraph, NodeKey};
pub use handler::{FlowTarget, PacketFilter, ProbeContext, ProbeHandler, TargetStats};
