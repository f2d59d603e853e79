//! Termination signal listener
//!
//! Runs on its own task and reports into a single-consumer channel, so the
//! supervisor can observe a signal while it is blocked on readiness polling
//! or on child exits.

use std::fmt;
use std::io;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Install SIGINT/SIGTERM handlers and return the receiving end
#[cfg(unix)]
pub fn listen() -> io::Result<mpsc::Receiver<ShutdownSignal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = interrupt.recv() => ShutdownSignal::Interrupt,
                _ = terminate.recv() => ShutdownSignal::Terminate,
            };
            debug!("Received {}", received);
            // A full channel already holds a pending shutdown request
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(received) {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(not(unix))]
pub fn listen() -> io::Result<mpsc::Receiver<ShutdownSignal>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl+C");
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                tx.try_send(ShutdownSignal::Interrupt)
            {
                break;
            }
        }
    });

    Ok(rx)
}
