//! Network namespace topology probe
//!
//! Watches the directory where named network namespaces are bind-mounted
//! (`ip netns` uses `/var/run/netns`) and mirrors each one as a `netns` node
//! owned by the host node.
//!
//! Only Linux has network namespaces. Elsewhere, and on Linux kernels built
//! without namespace support, construction returns
//! [`ProbeError::Unsupported`].

use crate::capability::CapabilityKind;
use crate::error::ProbeError;
use crate::handler::{ProbeContext, ProbeHandler};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Options accepted under `agent.topology.netns`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetnsConfig {
    pub run_path: PathBuf,
    pub proc_path: PathBuf,
    pub interval_ms: u64,
}

impl Default for NetnsConfig {
    fn default() -> Self {
        Self {
            run_path: PathBuf::from("/var/run/netns"),
            proc_path: PathBuf::from("/proc"),
            interval_ms: 3000,
        }
    }
}

impl NetnsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

#[cfg(target_os = "linux")]
pub fn new_probe(ctx: ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> {
    let config: NetnsConfig = ctx.options(CapabilityKind::NETNS)?;
    let probe = linux::NetnsProbe::new(ctx, config)?;
    Ok(Box::new(probe))
}

#[cfg(not(target_os = "linux"))]
pub fn new_probe(_ctx: ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> {
    Err(ProbeError::unsupported(CapabilityKind::NETNS))
}

#[cfg(target_os = "linux")]
pub use linux::NetnsProbe;

#[cfg(target_os = "linux")]
mod linux {
    use super::NetnsConfig;
    use crate::capability::CapabilityKind;
    use crate::error::ProbeError;
    use crate::graph::{Edge, EdgeKey, Graph, Metadata, Node, NodeKey};
    use crate::handler::{ProbeContext, ProbeHandler};
    use crate::lifecycle::{Lifecycle, Transition};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use log::{debug, info, warn};
    use std::collections::HashSet;
    use std::fs;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    const OWNERSHIP: &str = "ownership";

    /// Namespaces currently mirrored in the graph, keyed by mount path
    struct NamespaceTracker {
        graph: Arc<dyn Graph>,
        host: NodeKey,
        run_path: PathBuf,
        known: DashMap<PathBuf, (NodeKey, EdgeKey)>,
    }

    impl NamespaceTracker {
        /// Bring the graph in line with the content of `run_path`
        fn sync(&self) -> io::Result<()> {
            let present = self.scan()?;

            for path in &present {
                if !self.known.contains_key(path) {
                    self.add(path);
                }
            }

            let vanished: Vec<PathBuf> = self
                .known
                .iter()
                .filter(|entry| !present.contains(entry.key()))
                .map(|entry| entry.key().clone())
                .collect();
            for path in vanished {
                self.retract(&path);
            }

            Ok(())
        }

        fn scan(&self) -> io::Result<HashSet<PathBuf>> {
            let entries = match fs::read_dir(&self.run_path) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} does not exist yet", self.run_path.display());
                    return Ok(HashSet::new());
                }
                Err(e) => return Err(e),
            };

            let mut present = HashSet::new();
            for entry in entries {
                let path = entry?.path();
                if !path.is_dir() {
                    present.insert(path);
                }
            }
            Ok(present)
        }

        fn add(&self, path: &Path) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let key = NodeKey::new(format!("netns/{}", path.display()));

            let mut metadata = Metadata::new();
            metadata.insert("Type".to_string(), "netns".to_string());
            metadata.insert("Name".to_string(), name.clone());
            metadata.insert("Path".to_string(), path.display().to_string());
            if let Ok(meta) = fs::metadata(path) {
                metadata.insert("Inode".to_string(), meta.ino().to_string());
            }
            self.graph.add_or_update_node(Node::new(key.clone(), metadata));

            let edge_key = EdgeKey::between(&self.host, &key, OWNERSHIP);
            let mut edge_metadata = Metadata::new();
            edge_metadata.insert("RelationType".to_string(), OWNERSHIP.to_string());
            self.graph.add_or_update_edge(Edge {
                key: edge_key.clone(),
                parent: self.host.clone(),
                child: key.clone(),
                metadata: edge_metadata,
            });

            info!("Network namespace added: {}", name);
            self.known.insert(path.to_path_buf(), (key, edge_key));
        }

        fn retract(&self, path: &Path) {
            if let Some((_, (key, edge_key))) = self.known.remove(path) {
                self.graph.remove_edge(&edge_key);
                self.graph.remove_node(&key);
                info!("Network namespace removed: {}", path.display());
            }
        }

        fn retract_all(&self) {
            let paths: Vec<PathBuf> = self.known.iter().map(|e| e.key().clone()).collect();
            for path in paths {
                self.retract(&path);
            }
        }
    }

    pub struct NetnsProbe {
        kind: CapabilityKind,
        config: NetnsConfig,
        tracker: Arc<NamespaceTracker>,
        lifecycle: Lifecycle,
        task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    }

    impl NetnsProbe {
        pub fn new(ctx: ProbeContext, config: NetnsConfig) -> Result<Self, ProbeError> {
            let ns_handle = config.proc_path.join("self/ns/net");
            if !ns_handle.exists() {
                warn!(
                    "{} not found, network namespaces unavailable",
                    ns_handle.display()
                );
                return Err(ProbeError::unsupported(CapabilityKind::NETNS));
            }

            let tracker = NamespaceTracker {
                graph: ctx.graph,
                host: ctx.host,
                run_path: config.run_path.clone(),
                known: DashMap::new(),
            };

            Ok(Self {
                kind: CapabilityKind::new(CapabilityKind::NETNS),
                config,
                tracker: Arc::new(tracker),
                lifecycle: Lifecycle::new(),
                task: Mutex::new(None),
            })
        }

        /// Number of namespaces currently mirrored in the graph
        pub fn namespace_count(&self) -> usize {
            self.tracker.known.len()
        }
    }

    #[async_trait]
    impl ProbeHandler for NetnsProbe {
        fn kind(&self) -> &CapabilityKind {
            &self.kind
        }

        async fn start(&self) -> Result<(), ProbeError> {
            let mut task = self.task.lock().await;
            match self.lifecycle.begin_start() {
                Transition::Proceed => {}
                Transition::Noop => return Ok(()),
                Transition::Rejected => {
                    return Err(ProbeError::AlreadyStopped {
                        kind: self.kind.to_string(),
                    })
                }
            }

            if let Err(e) = self.tracker.sync() {
                self.tracker.retract_all();
                return Err(ProbeError::start(
                    CapabilityKind::NETNS,
                    format!("failed to scan {}: {}", self.config.run_path.display(), e),
                ));
            }

            let token = CancellationToken::new();
            let cancelled = token.clone();
            let tracker = self.tracker.clone();
            let interval = self.config.interval();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = tracker.sync() {
                                warn!("Network namespace scan failed: {}", e);
                            }
                        }
                    }
                }
            });
            *task = Some((token, handle));

            self.lifecycle.mark_running();
            info!(
                "Network namespace probe started, watching {}",
                self.config.run_path.display()
            );
            Ok(())
        }

        async fn stop(&self) {
            let mut task = self.task.lock().await;
            if self.lifecycle.begin_stop() != Transition::Proceed {
                return;
            }

            if let Some((token, handle)) = task.take() {
                token.cancel();
                if let Err(e) = handle.await {
                    warn!("Network namespace scan task ended abnormally: {}", e);
                }
            }
            self.tracker.retract_all();
            info!("Network namespace probe stopped");
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::graph::MemoryGraph;
        use std::time::Duration;

        fn fake_proc() -> tempfile::TempDir {
            let proc_dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(proc_dir.path().join("self/ns")).unwrap();
            fs::write(proc_dir.path().join("self/ns/net"), b"").unwrap();
            proc_dir
        }

        fn probe(graph: &MemoryGraph, run: &Path, proc_path: &Path) -> NetnsProbe {
            let ctx = ProbeContext::new(Arc::new(graph.clone()), NodeKey::new("host/test"));
            let config = NetnsConfig {
                run_path: run.to_path_buf(),
                proc_path: proc_path.to_path_buf(),
                interval_ms: 20,
            };
            NetnsProbe::new(ctx, config).expect("netns supported")
        }

        #[test]
        fn test_missing_ns_handle_is_unsupported() {
            let empty_proc = tempfile::tempdir().unwrap();
            let ctx = ProbeContext::new(Arc::new(MemoryGraph::new()), NodeKey::new("host/test"));
            let config = NetnsConfig {
                proc_path: empty_proc.path().to_path_buf(),
                ..NetnsConfig::default()
            };

            let err = NetnsProbe::new(ctx, config).err().expect("unsupported");
            assert!(err.is_unsupported());
        }

        #[tokio::test]
        async fn test_initial_scan_and_retraction() {
            let proc_dir = fake_proc();
            let run = tempfile::tempdir().unwrap();
            fs::write(run.path().join("blue"), b"").unwrap();
            fs::write(run.path().join("red"), b"").unwrap();

            let graph = MemoryGraph::new();
            let probe = probe(&graph, run.path(), proc_dir.path());

            probe.start().await.unwrap();
            assert_eq!(probe.namespace_count(), 2);
            assert_eq!(graph.node_count(), 2);
            assert_eq!(graph.edge_count(), 2);

            probe.stop().await;
            assert_eq!(graph.node_count(), 0);
            assert_eq!(graph.edge_count(), 0);

            // Second stop is a no-op
            probe.stop().await;
        }

        #[tokio::test]
        async fn test_rescan_tracks_changes() {
            let proc_dir = fake_proc();
            let run = tempfile::tempdir().unwrap();
            fs::write(run.path().join("blue"), b"").unwrap();

            let graph = MemoryGraph::new();
            let probe = probe(&graph, run.path(), proc_dir.path());
            probe.start().await.unwrap();

            fs::remove_file(run.path().join("blue")).unwrap();
            fs::write(run.path().join("green"), b"").unwrap();

            let green = NodeKey::new(format!("netns/{}", run.path().join("green").display()));
            let mut seen = false;
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if graph.node(&green).is_some() && graph.node_count() == 1 {
                    seen = true;
                    break;
                }
            }
            assert!(seen, "rescan did not pick up namespace changes");

            probe.stop().await;
            assert_eq!(graph.node_count(), 0);
        }

        #[tokio::test]
        async fn test_missing_run_path_starts_empty() {
            let proc_dir = fake_proc();
            let run = tempfile::tempdir().unwrap();
            let graph = MemoryGraph::new();
            let probe = probe(&graph, &run.path().join("absent"), proc_dir.path());

            probe.start().await.unwrap();
            assert_eq!(probe.namespace_count(), 0);
            probe.stop().await;
        }
    }
}
