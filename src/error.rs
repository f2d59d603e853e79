use crate::supervisor::process::Role;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopowatchError {
    #[error("All-in-one mode has to be run as root (effective uid {euid})")]
    Privilege { euid: u32 },

    #[error("Can't start {role}: {source}")]
    Spawn {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    #[error("Analyzer not ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout { attempts: u32, last_error: String },

    #[error("Startup interrupted by signal")]
    StartupInterrupted,

    #[error("Invalid service address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TopowatchError>;
