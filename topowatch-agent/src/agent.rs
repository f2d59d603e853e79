//! Agent runtime: assembles the probe bundle and drives its lifecycle

use crate::bundle::{BundleReport, HandlerOutcome, ProbeBundle};
use crate::capability::{CapabilityKind, CapabilityRegistry};
use crate::error::ProbeError;
use crate::graph::{MemoryGraph, NodeKey};
use crate::handler::ProbeContext;
use crate::topology::host::{host_node_key, local_hostname};
use anyhow::{ensure, Result};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use topowatch_common::Capture;

/// What the agent should run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Topology probe kinds, each registered under its own name
    pub probes: Vec<String>,
    /// Options for the netns probe
    pub netns: serde_json::Value,
    /// One flow target per capture
    pub captures: Vec<Capture>,
    /// Analyzers the agent reports to
    pub analyzers: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            probes: vec![
                CapabilityKind::HOST.to_string(),
                CapabilityKind::NETNS.to_string(),
            ],
            netns: serde_json::Value::Null,
            captures: Vec::new(),
            analyzers: Vec::new(),
        }
    }
}

pub struct Agent {
    graph: MemoryGraph,
    host: NodeKey,
    bundle: ProbeBundle,
}

impl Agent {
    /// Build the bundle. Handlers that cannot be constructed are logged and
    /// stay in the bundle as inactive entries.
    pub fn build(config: &AgentConfig, registry: &CapabilityRegistry) -> Result<Self> {
        ensure!(
            !config.probes.is_empty() || !config.captures.is_empty(),
            "no probe or capture configured"
        );
        for (index, kind) in config.probes.iter().enumerate() {
            ensure!(
                !config.probes[..index].contains(kind),
                "probe {} configured more than once",
                kind
            );
        }

        let graph = MemoryGraph::new();
        let host = host_node_key(&local_hostname());
        let bundle = ProbeBundle::new();
        let base = ProbeContext::new(Arc::new(graph.clone()), host.clone());

        for kind in &config.probes {
            let ctx = match kind.as_str() {
                CapabilityKind::NETNS => base.clone().with_options(config.netns.clone()),
                _ => base.clone(),
            };
            add_handler(&bundle, registry, kind, kind, ctx);
        }

        for (index, capture) in config.captures.iter().enumerate() {
            let id = format!("capture-{}", index);
            let ctx = base.clone().with_capture(capture.clone());
            add_handler(&bundle, registry, &id, CapabilityKind::ERSPAN, ctx);
        }

        Ok(Self {
            graph,
            host,
            bundle,
        })
    }

    pub async fn start(&self) -> BundleReport {
        let report = self.bundle.start_all().await;
        log_report(&report);
        report
    }

    pub async fn stop(&self) -> BundleReport {
        self.bundle.stop_all().await
    }

    pub fn graph(&self) -> &MemoryGraph {
        &self.graph
    }

    pub fn host(&self) -> &NodeKey {
        &self.host
    }

    pub fn bundle(&self) -> &ProbeBundle {
        &self.bundle
    }
}

fn add_handler(
    bundle: &ProbeBundle,
    registry: &CapabilityRegistry,
    id: &str,
    kind: &str,
    ctx: ProbeContext,
) {
    match bundle.add_kind(registry, id, kind, ctx) {
        Ok(()) => {}
        Err(e @ ProbeError::DuplicateId(_)) => warn!("{} ({}) not added: {}", id, kind, e),
        // Kept as an inactive slot, reported by start
        Err(_) => {}
    }
}

fn log_report(report: &BundleReport) {
    for (id, outcome) in &report.outcomes {
        match outcome {
            HandlerOutcome::Failed(e) if e.is_unsupported() => {
                info!("{}: not available on this host ({})", id, e)
            }
            HandlerOutcome::Failed(e) => warn!("{}: {}", id, e),
            _ => {}
        }
    }
}

/// Run the agent until `shutdown` resolves
pub async fn run<F>(config: AgentConfig, registry: &CapabilityRegistry, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    if config.analyzers.is_empty() {
        warn!("No analyzer configured, topology stays local");
    } else {
        info!("Reporting to analyzers: {}", config.analyzers.join(", "));
    }

    let agent = Agent::build(&config, registry)?;
    let report = agent.start().await;
    let started = report
        .outcomes
        .iter()
        .filter(|(_, o)| *o == HandlerOutcome::Started)
        .count();
    info!(
        "topowatch agent running: {}/{} handlers active",
        started,
        report.outcomes.len()
    );

    shutdown.await;
    info!("Shutdown signal received");

    agent.stop().await;
    info!("topowatch agent stopped");
    Ok(())
}
