//! Child process descriptors and the OS launcher

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Analyzer,
    Agent,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Analyzer => "analyzer",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity a child runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
}

/// A running child process owned by the supervisor
#[async_trait]
pub trait ChildHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the child to exit (SIGINT)
    fn interrupt(&mut self) -> io::Result<()>;

    /// Wait for exit, returning the exit code if there is one
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Everything needed to spawn one child
pub struct ChildProcessDescriptor {
    pub role: Role,
    pub binary_path: PathBuf,
    pub argv: Vec<String>,
    /// Added on top of the supervisor's own environment
    pub env: BTreeMap<String, String>,
    pub credential: Option<Credential>,
    pub handle: Option<Box<dyn ChildHandle>>,
}

impl ChildProcessDescriptor {
    pub fn new(role: Role, binary_path: PathBuf, argv: Vec<String>) -> Self {
        Self {
            role,
            binary_path,
            argv,
            env: BTreeMap::new(),
            credential: None,
            handle: None,
        }
    }
}

impl fmt::Debug for ChildProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessDescriptor")
            .field("role", &self.role)
            .field("binary_path", &self.binary_path)
            .field("argv", &self.argv)
            .field("env", &self.env)
            .field("credential", &self.credential)
            .field("pid", &self.handle.as_ref().and_then(|h| h.id()))
            .finish()
    }
}

/// Creates OS processes from descriptors
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, descriptor: &ChildProcessDescriptor) -> io::Result<Box<dyn ChildHandle>>;
}

/// Spawns real processes with tokio, inheriting stdio and environment
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn spawn(&self, descriptor: &ChildProcessDescriptor) -> io::Result<Box<dyn ChildHandle>> {
        let mut command = tokio::process::Command::new(&descriptor.binary_path);
        command.args(&descriptor.argv).envs(&descriptor.env);

        #[cfg(unix)]
        if let Some(credential) = descriptor.credential {
            // setuid failure in the child surfaces as a spawn error
            command.uid(credential.uid);
        }

        let child = command.spawn()?;
        debug!(
            "Spawned {} (pid {:?}): {} {}",
            descriptor.role,
            child.id(),
            descriptor.binary_path.display(),
            descriptor.argv.join(" ")
        );
        Ok(Box::new(OsChild { child }))
    }
}

struct OsChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildHandle for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(()),
            _ => Err(err),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}
