//! Host topology probe
//!
//! Publishes the node representing the local host. Other topology probes
//! attach their nodes to it.

use crate::capability::CapabilityKind;
use crate::error::ProbeError;
use crate::graph::{Graph, Metadata, Node, NodeKey};
use crate::handler::{ProbeContext, ProbeHandler};
use crate::lifecycle::{Lifecycle, Transition};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hostname of this machine, `unknown` when it cannot be read
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Graph key of the node representing `hostname`
pub fn host_node_key(hostname: &str) -> NodeKey {
    NodeKey::new(format!("host/{}", hostname))
}

pub struct HostProbe {
    kind: CapabilityKind,
    graph: Arc<dyn Graph>,
    key: NodeKey,
    hostname: String,
    lifecycle: Lifecycle,
    // Serializes start against stop
    guard: Mutex<()>,
}

impl HostProbe {
    pub fn new(ctx: ProbeContext) -> Self {
        Self {
            kind: CapabilityKind::new(CapabilityKind::HOST),
            graph: ctx.graph,
            key: ctx.host,
            hostname: local_hostname(),
            lifecycle: Lifecycle::new(),
            guard: Mutex::new(()),
        }
    }
}

pub fn new_probe(ctx: ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> {
    Ok(Box::new(HostProbe::new(ctx)))
}

#[async_trait]
impl ProbeHandler for HostProbe {
    fn kind(&self) -> &CapabilityKind {
        &self.kind
    }

    async fn start(&self) -> Result<(), ProbeError> {
        let _guard = self.guard.lock().await;
        match self.lifecycle.begin_start() {
            Transition::Proceed => {}
            Transition::Noop => return Ok(()),
            Transition::Rejected => {
                return Err(ProbeError::AlreadyStopped {
                    kind: self.kind.to_string(),
                })
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("Type".to_string(), "host".to_string());
        metadata.insert("Hostname".to_string(), self.hostname.clone());
        self.graph
            .add_or_update_node(Node::new(self.key.clone(), metadata));

        self.lifecycle.mark_running();
        info!("Host probe started: {}", self.key);
        Ok(())
    }

    async fn stop(&self) {
        let _guard = self.guard.lock().await;
        if self.lifecycle.begin_stop() != Transition::Proceed {
            return;
        }
        self.graph.remove_node(&self.key);
        debug!("Host probe stopped: {}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    #[tokio::test]
    async fn test_host_node_added_and_retracted() {
        let graph = MemoryGraph::new();
        let key = host_node_key("node-1");
        let probe = HostProbe::new(ProbeContext::new(Arc::new(graph.clone()), key.clone()));

        probe.start().await.unwrap();
        let node = graph.node(&key).expect("host node published");
        assert_eq!(node.metadata.get("Type").map(String::as_str), Some("host"));

        probe.stop().await;
        assert!(graph.node(&key).is_none());

        let err = probe.start().await.unwrap_err();
        assert!(matches!(err, ProbeError::AlreadyStopped { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_racing_stop_never_leaves_node() {
        for i in 0..100 {
            let graph = MemoryGraph::new();
            let key = host_node_key(&format!("node-{}", i));
            let probe: Arc<dyn ProbeHandler> = Arc::new(HostProbe::new(ProbeContext::new(
                Arc::new(graph.clone()),
                key.clone(),
            )));

            let starter = tokio::spawn({
                let probe = probe.clone();
                async move { probe.start().await }
            });
            let stopper = tokio::spawn({
                let probe = probe.clone();
                async move { probe.stop().await }
            });
            let started = starter.await.unwrap();
            stopper.await.unwrap();

            // Either start ran first and stop retracted the node, or stop
            // won and start was refused
            if let Err(e) = started {
                assert!(matches!(e, ProbeError::AlreadyStopped { .. }));
            }
            assert!(graph.node(&key).is_none());
        }
    }
}
