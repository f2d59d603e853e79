//! Shared types between the supervisor, the analyzer and the agent
//!
//! This crate defines what crosses process boundaries:
//! - environment variables the supervisor sets for its children
//! - the capture specification a flow target is built from

use serde::{Deserialize, Serialize};

/// Environment variables exchanged between the supervisor and its children
pub mod env {
    /// Analyzer address list (`HOST:PORT[,HOST:PORT...]`) handed to the agent
    pub const ANALYZERS: &str = "TOPOWATCH_ANALYZERS";

    /// Per-role log file path
    pub const LOGGING_FILE_PATH: &str = "TOPOWATCH_LOGGING_FILE_PATH";
}

/// Default analyzer listen port
pub const DEFAULT_ANALYZER_PORT: u16 = 8082;

/// Path of the analyzer API root, used for readiness checks
pub const API_ROOT: &str = "/api";

/// A packet capture request bound to a topology node
///
/// `node` is a lookup key into the graph, never an owning reference: the node
/// may disappear while the capture is still configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// Graph node key the capture is attached to
    pub node: String,

    /// Packet filter expression, compiled by the capture backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpf_filter: Option<String>,

    /// Mirror destination address
    pub target: String,

    /// Encapsulation type, e.g. `erspanv1`
    #[serde(default = "default_target_type")]
    pub target_type: String,

    /// ERSPAN session identifier (10 bits)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u16>,
}

fn default_target_type() -> String {
    "erspanv1".to_string()
}

/// Split a comma separated analyzer list as found in [`env::ANALYZERS`]
pub fn parse_analyzers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
