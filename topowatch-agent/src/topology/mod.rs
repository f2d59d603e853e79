//! Topology probes: observe host state and mirror it into the graph

pub mod host;
pub mod netns;
