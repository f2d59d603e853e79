//! ERSPAN mirroring target
//!
//! Captured frames are wrapped in a GRE header (with sequence numbers) and an
//! ERSPAN type II header, then sent to the configured collector. Forwarding
//! is best effort: `receive` only enqueues into a bounded queue drained by a
//! background task, so the capture pipeline never waits on the network.
//!
//! The raw GRE socket is Linux only. On other platforms the registered
//! constructor returns [`ProbeError::Unsupported`].

use crate::capability::CapabilityKind;
use crate::error::ProbeError;
use crate::graph::{Graph, NodeKey};
use crate::handler::{FlowTarget, PacketFilter, ProbeContext, ProbeHandler, TargetStats};
use crate::lifecycle::{Lifecycle, Transition};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use serde::Deserialize;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use topowatch_common::Capture;

/// GRE protocol type for ERSPAN type II
const ETHERTYPE_ERSPAN_II: u16 = 0x88BE;
/// GRE flags: sequence number present
const GRE_FLAG_SEQUENCE: u16 = 0x1000;
const ERSPAN_VERSION_II: u16 = 1;
const MAX_SESSION_ID: u16 = 0x03FF;
const ETHERNET_HEADER_LEN: usize = 14;

/// GRE (8 bytes) + ERSPAN type II (8 bytes)
pub const ENCAPSULATION_OVERHEAD: usize = 16;

/// Opaque filter program, compiled by the capture backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram(String);

impl FilterProgram {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn expression(&self) -> &str {
        &self.0
    }
}

/// Where mirrored frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub addr: Ipv4Addr,
    pub session_id: u16,
}

/// A capture bound to a graph node. The node key is a lookup key only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDescriptor {
    pub node: NodeKey,
    pub filter: Option<FilterProgram>,
    pub destination: Destination,
}

impl CaptureDescriptor {
    pub fn from_capture(capture: &Capture) -> Result<Self, ProbeError> {
        let invalid = |reason: String| ProbeError::construction(CapabilityKind::ERSPAN, reason);

        if !capture.target_type.eq_ignore_ascii_case("erspanv1") {
            return Err(invalid(format!(
                "unsupported target type {}",
                capture.target_type
            )));
        }

        let addr = parse_target(&capture.target)
            .ok_or_else(|| invalid(format!("invalid target address {}", capture.target)))?;

        let session_id = capture.session_id.unwrap_or(1);
        if session_id > MAX_SESSION_ID {
            return Err(invalid(format!(
                "session id {} exceeds {}",
                session_id, MAX_SESSION_ID
            )));
        }

        Ok(Self {
            node: NodeKey::new(capture.node.clone()),
            filter: capture.bpf_filter.clone().map(FilterProgram::new),
            destination: Destination { addr, session_id },
        })
    }
}

/// Accepts `a.b.c.d` or `a.b.c.d:port`; GRE has no ports so one is ignored
fn parse_target(target: &str) -> Option<Ipv4Addr> {
    target
        .parse::<Ipv4Addr>()
        .ok()
        .or_else(|| target.parse::<SocketAddrV4>().ok().map(|s| *s.ip()))
}

/// Wrap `frame` in GRE + ERSPAN type II headers
pub fn encapsulate(frame: &[u8], sequence: u32, session_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENCAPSULATION_OVERHEAD + frame.len());

    buf.put_u16(GRE_FLAG_SEQUENCE);
    buf.put_u16(ETHERTYPE_ERSPAN_II);
    buf.put_u32(sequence);

    // Ver | VLAN
    buf.put_u16(ERSPAN_VERSION_II << 12);
    // COS | En | T | Session ID
    buf.put_u16(session_id & MAX_SESSION_ID);
    // Reserved | Index
    buf.put_u32(0);

    buf.put_slice(frame);
    buf.freeze()
}

/// Sends one encapsulated frame towards the collector
pub trait Forwarder: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Opens the destination when the target is started
pub type Connector = Arc<dyn Fn(&Destination) -> io::Result<Box<dyn Forwarder>> + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    inactive: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
    filtered: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    send_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TargetStats {
        TargetStats {
            inactive: self.inactive.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Options accepted alongside an ERSPAN capture
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErspanOptions {
    pub queue_size: usize,
}

impl Default for ErspanOptions {
    fn default() -> Self {
        Self { queue_size: 1024 }
    }
}

pub struct ErspanTarget {
    kind: CapabilityKind,
    graph: Arc<dyn Graph>,
    descriptor: CaptureDescriptor,
    connector: Connector,
    queue_size: usize,
    lifecycle: Lifecycle,
    counters: Arc<Counters>,
    sequence: AtomicU32,
    queue: RwLock<Option<mpsc::Sender<Bytes>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ErspanTarget {
    pub fn new(
        graph: Arc<dyn Graph>,
        descriptor: CaptureDescriptor,
        connector: Connector,
        options: ErspanOptions,
    ) -> Self {
        Self {
            kind: CapabilityKind::new(CapabilityKind::ERSPAN),
            graph,
            descriptor,
            connector,
            queue_size: options.queue_size.max(1),
            lifecycle: Lifecycle::new(),
            counters: Arc::new(Counters::default()),
            sequence: AtomicU32::new(0),
            queue: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &CaptureDescriptor {
        &self.descriptor
    }

    /// True while frames are being mirrored
    pub fn is_armed(&self) -> bool {
        self.queue
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn attach_queue(&self, tx: mpsc::Sender<Bytes>) {
        *self.queue.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    fn detach_queue(&self) -> Option<mpsc::Sender<Bytes>> {
        self.queue.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(target_os = "linux")]
pub fn new_target(ctx: ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> {
    let capture = ctx.capture.as_ref().ok_or_else(|| {
        ProbeError::construction(CapabilityKind::ERSPAN, "missing capture specification")
    })?;
    let descriptor = CaptureDescriptor::from_capture(capture)?;
    let options: ErspanOptions = ctx.options(CapabilityKind::ERSPAN)?;
    let connector: Connector = Arc::new(|destination: &Destination| {
        let forwarder = raw::RawGreForwarder::connect(destination.addr)?;
        Ok(Box::new(forwarder) as Box<dyn Forwarder>)
    });

    Ok(Box::new(ErspanTarget::new(
        ctx.graph,
        descriptor,
        connector,
        options,
    )))
}

#[cfg(not(target_os = "linux"))]
pub fn new_target(_ctx: ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> {
    Err(ProbeError::unsupported(CapabilityKind::ERSPAN))
}

async fn forward(
    mut rx: mpsc::Receiver<Bytes>,
    forwarder: Box<dyn Forwarder>,
    counters: Arc<Counters>,
    cancelled: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                match forwarder.send(&frame) {
                    Ok(_) => Counters::bump(&counters.forwarded),
                    Err(e) => {
                        Counters::bump(&counters.send_errors);
                        debug!("ERSPAN send failed: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProbeHandler for ErspanTarget {
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

        if self.graph.node(&self.descriptor.node).is_none() {
            warn!(
                "Capture node {} not found, ERSPAN target inactive",
                self.descriptor.node
            );
            self.lifecycle.mark_running();
            return Ok(());
        }

        let destination = self.descriptor.destination;
        let forwarder = (self.connector)(&destination).map_err(|e| {
            ProbeError::start(
                CapabilityKind::ERSPAN,
                format!("cannot open destination {}: {}", destination.addr, e),
            )
        })?;

        let (tx, rx) = mpsc::channel(self.queue_size);
        let token = CancellationToken::new();
        let handle = tokio::spawn(forward(
            rx,
            forwarder,
            self.counters.clone(),
            token.clone(),
        ));
        self.attach_queue(tx);
        *task = Some((token, handle));

        self.lifecycle.mark_running();
        info!(
            "ERSPAN target armed: node={} destination={} session={}",
            self.descriptor.node, destination.addr, destination.session_id
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut task = self.task.lock().await;
        if self.lifecycle.begin_stop() != Transition::Proceed {
            return;
        }

        // Once detached no receive can enqueue any more
        drop(self.detach_queue());

        if let Some((token, handle)) = task.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("ERSPAN forwarding task ended abnormally: {}", e);
            }
        }
        info!("ERSPAN target disarmed: node={}", self.descriptor.node);
    }

    fn as_target(&self) -> Option<&dyn FlowTarget> {
        Some(self)
    }
}

impl FlowTarget for ErspanTarget {
    fn receive(&self, packet: &[u8], filter: Option<&dyn PacketFilter>) {
        let queue = self.queue.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = queue.as_ref() else {
            Counters::bump(&self.counters.inactive);
            return;
        };
        Counters::bump(&self.counters.received);

        if let Some(filter) = filter {
            if !filter.matches(packet) {
                Counters::bump(&self.counters.filtered);
                return;
            }
        }

        if packet.len() < ETHERNET_HEADER_LEN {
            Counters::bump(&self.counters.malformed);
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = encapsulate(packet, sequence, self.descriptor.destination.session_id);
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Counters::bump(&self.counters.dropped);
            }
        }
    }

    fn stats(&self) -> TargetStats {
        self.counters.snapshot()
    }
}

#[cfg(target_os = "linux")]
mod raw {
    use super::Forwarder;
    use std::io;
    use std::mem;
    use std::net::Ipv4Addr;

    /// Connected raw IPv4 socket carrying GRE (protocol 47)
    pub struct RawGreForwarder {
        fd: libc::c_int,
    }

    impl RawGreForwarder {
        pub fn connect(addr: Ipv4Addr) -> io::Result<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_INET,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    libc::IPPROTO_GRE,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
            sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
            sockaddr.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.octets()),
            };

            let ret = unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            Ok(Self { fd })
        }
    }

    impl Forwarder for RawGreForwarder {
        fn send(&self, frame: &[u8]) -> io::Result<usize> {
            let sent = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if sent < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(sent as usize)
            }
        }
    }

    impl Drop for RawGreForwarder {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}
