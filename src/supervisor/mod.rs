//! All-in-one cluster supervisor
//!
//! Boots an analyzer, waits for its API to answer, then boots an agent
//! pointed at it. Both children are interrupted together on SIGINT/SIGTERM.
//!
//! ```text
//! Idle -> AnalyzerSpawning -> AnalyzerHealthPolling -> AgentSpawning
//!      -> Running -> ShuttingDown -> Stopped
//! ```
//! Any failure before `Running` ends in `Failed`, after the analyzer (if it
//! was spawned) has been interrupted and reaped.

pub mod address;
pub mod process;
pub mod readiness;
pub mod signal;

use crate::cli::ConfigArgs;
use crate::config::Config;
use crate::{Result, TopowatchError};
use address::ServiceAddress;
use futures::future::join_all;
use process::{ChildProcessDescriptor, Credential, ProcessLauncher, Role};
use readiness::{ReadinessCheck, RestClient};
use signal::ShutdownSignal;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use topowatch_common::{env, API_ROOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    AnalyzerSpawning,
    AnalyzerHealthPolling,
    AgentSpawning,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs of the supervisor, resolved from configuration and flags
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Executable re-run for both children
    pub binary_path: PathBuf,
    pub config_files: Vec<PathBuf>,
    pub config_backend: Option<String>,
    /// Base log path, suffixed per role
    pub log_file: Option<PathBuf>,
    /// Analyzer bind address as configured
    pub analyzer_listen: ServiceAddress,
    /// Identity for the analyzer; 0 keeps the supervisor's own
    pub analyzer_uid: Option<u32>,
    pub readiness: ReadinessCheck,
}

impl SupervisorSettings {
    pub fn from_config(
        config: &Config,
        args: &ConfigArgs,
        binary_path: PathBuf,
        analyzer_uid: Option<u32>,
    ) -> Result<Self> {
        let analyzer_uid = analyzer_uid.or_else(|| executable_owner(&binary_path));

        Ok(Self {
            config_files: args.files.clone(),
            config_backend: args.backend.clone(),
            log_file: config.logging.file.path.clone(),
            analyzer_listen: ServiceAddress::parse(&config.analyzer.listen)?,
            analyzer_uid,
            readiness: ReadinessCheck::new(API_ROOT, config.retry_policy()),
            binary_path,
        })
    }

    /// Address the agent (and the readiness probe) use to reach the analyzer
    pub fn analyzer_address(&self) -> ServiceAddress {
        self.analyzer_listen.connectable()
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for file in &self.config_files {
            args.push("-c".to_string());
            args.push(file.display().to_string());
        }
        if let Some(backend) = self.config_backend.as_deref().filter(|b| !b.is_empty()) {
            args.push("-b".to_string());
            args.push(backend.to_string());
        }
        args
    }

    fn role_log_file(&self, role: Role) -> Option<PathBuf> {
        self.log_file
            .as_deref()
            .map(|path| role_suffixed_path(path, role))
    }

    fn analyzer_descriptor(&self) -> ChildProcessDescriptor {
        let mut argv = self.base_args();
        argv.push(Role::Analyzer.as_str().to_string());

        let mut descriptor =
            ChildProcessDescriptor::new(Role::Analyzer, self.binary_path.clone(), argv);
        if let Some(path) = self.role_log_file(Role::Analyzer) {
            descriptor
                .env
                .insert(env::LOGGING_FILE_PATH.to_string(), path.display().to_string());
        }
        descriptor.credential = self
            .analyzer_uid
            .filter(|uid| *uid != 0)
            .map(|uid| Credential { uid });
        descriptor
    }

    fn agent_descriptor(&self) -> ChildProcessDescriptor {
        let mut argv = self.base_args();
        argv.push(Role::Agent.as_str().to_string());

        let mut descriptor = ChildProcessDescriptor::new(Role::Agent, self.binary_path.clone(), argv);
        descriptor.env.insert(
            env::ANALYZERS.to_string(),
            self.analyzer_address().to_string(),
        );
        if let Some(path) = self.role_log_file(Role::Agent) {
            descriptor
                .env
                .insert(env::LOGGING_FILE_PATH.to_string(), path.display().to_string());
        }
        descriptor
    }
}

/// `/var/log/topowatch.log` -> `/var/log/topowatch-agent.log`
pub fn role_suffixed_path(path: &Path, role: Role) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, role, ext.to_string_lossy()),
        None => format!("{}-{}", stem, role),
    };
    path.with_file_name(name)
}

#[cfg(unix)]
fn executable_owner(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.uid())
}

#[cfg(not(unix))]
fn executable_owner(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
pub fn current_euid() -> u32 {
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
pub fn current_euid() -> u32 {
    // No uid model: treat the caller as privileged
    0
}

/// All-in-one mode needs root for the agent's capture and namespace work
pub fn require_root(euid: u32) -> Result<()> {
    if euid != 0 {
        return Err(TopowatchError::Privilege { euid });
    }
    Ok(())
}

pub struct Supervisor<L, C> {
    settings: SupervisorSettings,
    launcher: L,
    client: C,
    euid: u32,
    state: SupervisorState,
}

impl<L, C> Supervisor<L, C>
where
    L: ProcessLauncher,
    C: RestClient,
{
    pub fn new(settings: SupervisorSettings, launcher: L, client: C) -> Self {
        Self {
            settings,
            launcher,
            client,
            euid: current_euid(),
            state: SupervisorState::Idle,
        }
    }

    /// Override the effective uid used by the privilege check
    pub fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run until both children have exited after a shutdown signal.
    ///
    /// Children's exit codes are logged only; errors are reserved for
    /// privilege, spawn and readiness failures.
    pub async fn run(&mut self, shutdown: &mut mpsc::Receiver<ShutdownSignal>) -> Result<()> {
        match self.supervise(shutdown).await {
            Ok(()) => {
                self.transition(SupervisorState::Stopped);
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                self.transition(SupervisorState::Failed);
                Err(e)
            }
        }
    }

    async fn supervise(&mut self, shutdown: &mut mpsc::Receiver<ShutdownSignal>) -> Result<()> {
        require_root(self.euid)?;

        self.transition(SupervisorState::AnalyzerSpawning);
        let mut analyzer = self.settings.analyzer_descriptor();
        self.spawn(&mut analyzer)?;

        self.transition(SupervisorState::AnalyzerHealthPolling);
        let polled = {
            let readiness = &self.settings.readiness;
            let client = &self.client;
            tokio::select! {
                result = readiness.wait(client) => Some(result),
                signal = shutdown.recv() => {
                    if let Some(signal) = signal {
                        info!("Received {} while waiting for the analyzer", signal);
                    }
                    None
                }
            }
        };
        match polled {
            Some(Ok(attempts)) => info!(
                "Analyzer ready at {} after {} attempt(s)",
                self.settings.analyzer_address(),
                attempts
            ),
            Some(Err(e)) => {
                terminate(&mut [&mut analyzer]).await;
                return Err(e);
            }
            None => {
                terminate(&mut [&mut analyzer]).await;
                return Err(TopowatchError::StartupInterrupted);
            }
        }

        self.transition(SupervisorState::AgentSpawning);
        let mut agent = self.settings.agent_descriptor();
        if let Err(e) = self.spawn(&mut agent) {
            terminate(&mut [&mut analyzer]).await;
            return Err(e);
        }

        self.transition(SupervisorState::Running);
        info!("topowatch all-in-one starting!");

        match shutdown.recv().await {
            Some(signal) => info!("Received {}, stopping", signal),
            None => warn!("Signal listener gone, stopping"),
        }

        self.transition(SupervisorState::ShuttingDown);
        terminate(&mut [&mut analyzer, &mut agent]).await;
        Ok(())
    }

    fn spawn(&self, descriptor: &mut ChildProcessDescriptor) -> Result<()> {
        let handle = self
            .launcher
            .spawn(descriptor)
            .map_err(|source| TopowatchError::Spawn {
                role: descriptor.role,
                source,
            })?;
        info!(
            "Started {} (pid {})",
            descriptor.role,
            handle
                .id()
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
        descriptor.handle = Some(handle);
        Ok(())
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!("Supervisor state: {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Interrupt every spawned child, then wait for all of them
async fn terminate(children: &mut [&mut ChildProcessDescriptor]) {
    for child in children.iter_mut() {
        if let Some(handle) = child.handle.as_mut() {
            if let Err(e) = handle.interrupt() {
                warn!("Failed to interrupt {}: {}", child.role, e);
            }
        }
    }

    let waits = children.iter_mut().filter_map(|child| {
        let role = child.role;
        child.handle.as_mut().map(|handle| async move {
            match handle.wait().await {
                Ok(Some(code)) => info!("{} exited with status {}", role, code),
                Ok(None) => info!("{} terminated by signal", role),
                Err(e) => warn!("Failed to wait for {}: {}", role, e),
            }
        })
    });
    join_all(waits).await;

    for child in children.iter_mut() {
        child.handle = None;
    }
}
