//! Capability registry: maps a probe/target kind to its constructor
//!
//! Every kind is registered on every platform. Where a capability has no
//! implementation, its constructor deterministically returns
//! [`ProbeError::Unsupported`], so callers see the same surface everywhere.
//!
//! The process-wide registry is built once and never mutated afterwards.

use crate::error::ProbeError;
use crate::handler::{ProbeContext, ProbeHandler};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Name of a probe or target type, e.g. `netns` or `erspan`
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapabilityKind(String);

impl CapabilityKind {
    pub const HOST: &'static str = "host";
    pub const NETNS: &'static str = "netns";
    pub const ERSPAN: &'static str = "erspan";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

pub type Constructor =
    Arc<dyn Fn(ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> + Send + Sync>;

/// Immutable kind -> constructor table
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    constructors: HashMap<CapabilityKind, Constructor>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn lookup(&self, kind: &str) -> Result<Constructor, ProbeError> {
        self.constructors
            .get(&CapabilityKind::new(kind))
            .cloned()
            .ok_or_else(|| ProbeError::UnknownKind(kind.to_string()))
    }

    /// Look up `kind` and run its constructor
    pub fn construct(
        &self,
        kind: &str,
        ctx: ProbeContext,
    ) -> Result<Box<dyn ProbeHandler>, ProbeError> {
        let constructor = self.lookup(kind)?;
        constructor(ctx)
    }

    pub fn kinds(&self) -> Vec<CapabilityKind> {
        let mut kinds: Vec<_> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(&CapabilityKind::new(kind))
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    constructors: HashMap<CapabilityKind, Constructor>,
}

impl RegistryBuilder {
    /// Register a constructor. A kind may only be registered once.
    pub fn register<F>(mut self, kind: &str, constructor: F) -> Result<Self, ProbeError>
    where
        F: Fn(ProbeContext) -> Result<Box<dyn ProbeHandler>, ProbeError> + Send + Sync + 'static,
    {
        let kind = CapabilityKind::new(kind);
        if self.constructors.contains_key(&kind) {
            return Err(ProbeError::DuplicateKind(kind.0));
        }
        debug!("Registering capability: {}", kind);
        self.constructors.insert(kind, Arc::new(constructor));
        Ok(self)
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            constructors: self.constructors,
        }
    }
}

static GLOBAL: OnceLock<CapabilityRegistry> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install(registry: CapabilityRegistry) -> Result<(), CapabilityRegistry> {
    GLOBAL.set(registry)
}

/// The process-wide registry, installing [`default_registry`] on first use
pub fn global() -> &'static CapabilityRegistry {
    GLOBAL.get_or_init(default_registry)
}

/// Registry with every built-in capability
pub fn default_registry() -> CapabilityRegistry {
    let builder = CapabilityRegistry::builder()
        .register(CapabilityKind::HOST, crate::topology::host::new_probe)
        .and_then(|b| b.register(CapabilityKind::NETNS, crate::topology::netns::new_probe))
        .and_then(|b| b.register(CapabilityKind::ERSPAN, crate::flow::erspan::new_target));

    match builder {
        Ok(builder) => builder.build(),
        // Built-in kinds are distinct constants
        Err(e) => unreachable!("built-in capability registered twice: {}", e),
    }
}
