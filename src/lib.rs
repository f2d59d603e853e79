pub mod analyzer;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod supervisor;

pub use error::{Result, TopowatchError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
