use std::sync::Arc;
use topowatch_agent::capability::{self, default_registry};
use topowatch_agent::graph::{Graph, Metadata, Node};
use topowatch_agent::topology::host::host_node_key;
use topowatch_agent::{
    CapabilityKind, HandlerOutcome, MemoryGraph, ProbeBundle, ProbeContext, ProbeError,
};
use topowatch_common::Capture;

fn context(graph: &MemoryGraph) -> ProbeContext {
    ProbeContext::new(Arc::new(graph.clone()), host_node_key("scenario"))
}

#[tokio::test]
async fn test_unsupported_netns_reported_while_sibling_starts() {
    let graph = MemoryGraph::new();
    let registry = default_registry();
    let bundle = ProbeBundle::new();

    // No namespace handle under this proc root: the mechanism is unavailable
    let missing_proc = tempfile::tempdir().unwrap();
    let netns_ctx = context(&graph).with_options(serde_json::json!({
        "proc_path": missing_proc.path(),
    }));

    let err = bundle
        .add_kind(&registry, "network-namespace", CapabilityKind::NETNS, netns_ctx)
        .unwrap_err();
    assert!(err.is_unsupported());
    bundle
        .add_kind(&registry, "host", CapabilityKind::HOST, context(&graph))
        .unwrap();

    let report = bundle.start_all().await;

    match report.outcome("network-namespace") {
        Some(HandlerOutcome::Failed(e)) => assert!(e.is_unsupported()),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.outcome("host"), Some(&HandlerOutcome::Started));

    let stop = bundle.stop_all().await;
    assert_eq!(
        stop.outcome("network-namespace"),
        Some(&HandlerOutcome::Skipped)
    );
    assert!(stop.is_success());
    assert_eq!(stop, bundle.stop_all().await);
}

#[test]
fn test_unsupported_lookup_is_typed_on_every_call() {
    let graph = MemoryGraph::new();
    let missing_proc = tempfile::tempdir().unwrap();

    for _ in 0..5 {
        let ctx = context(&graph).with_options(serde_json::json!({
            "proc_path": missing_proc.path(),
        }));
        let result = capability::global().construct(CapabilityKind::NETNS, ctx);
        assert!(matches!(result, Err(ProbeError::Unsupported { .. })));
    }
}

#[test]
fn test_invalid_options_are_construction_time_errors() {
    let graph = MemoryGraph::new();
    let ctx = context(&graph).with_options(serde_json::json!({ "interval_ms": "often" }));

    let result = default_registry().construct(CapabilityKind::NETNS, ctx);
    match result {
        Err(ProbeError::InvalidOptions { .. }) => {}
        Err(e) if e.is_unsupported() && !cfg!(target_os = "linux") => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("invalid options accepted"),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_erspan_target_inactive_when_node_gone() {
    let graph = MemoryGraph::new();
    let bundle = ProbeBundle::new();
    let capture = Capture {
        node: "host/gone".to_string(),
        bpf_filter: None,
        target: "192.0.2.1".to_string(),
        target_type: "ERSPANv1".to_string(),
        session_id: Some(3),
    };

    bundle
        .add_kind(
            &default_registry(),
            "mirror",
            CapabilityKind::ERSPAN,
            context(&graph).with_capture(capture),
        )
        .unwrap();

    // The capture node is absent, so the raw socket is never opened
    let report = bundle.start_all().await;
    assert_eq!(report.outcome("mirror"), Some(&HandlerOutcome::Started));

    let handler = bundle.handler("mirror").expect("constructed");
    let target = handler.as_target().expect("flow target");
    target.receive(&[0u8; 64], None);
    assert_eq!(target.stats().forwarded, 0);

    // Node showing up later does not re-arm a started target
    graph.add_or_update_node(Node::new(
        topowatch_agent::NodeKey::new("host/gone"),
        Metadata::new(),
    ));
    target.receive(&[0u8; 64], None);
    assert_eq!(target.stats().received, 0);

    bundle.stop_all().await;
}
