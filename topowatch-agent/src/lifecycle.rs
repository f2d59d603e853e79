//! Handler lifecycle bookkeeping
//!
//! `Created -> Running -> Stopped`. `Stopped` is terminal: a stopped handler
//! is never restarted.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
}

/// Result of asking the lifecycle to move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The caller must perform the side effects of the transition
    Proceed,
    /// Already in the requested state, nothing to do
    Noop,
    /// Requested start on a stopped handler
    Rejected,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Created),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Check whether a start may proceed. The state only changes once the
    /// caller reports success through [`Lifecycle::mark_running`].
    pub fn begin_start(&self) -> Transition {
        match *self.lock() {
            LifecycleState::Created => Transition::Proceed,
            LifecycleState::Running => Transition::Noop,
            LifecycleState::Stopped => Transition::Rejected,
        }
    }

    pub fn mark_running(&self) {
        let mut state = self.lock();
        if *state == LifecycleState::Created {
            *state = LifecycleState::Running;
        }
    }

    /// Move to `Stopped`. Returns `Proceed` only when the handler was running
    /// and teardown side effects are needed.
    pub fn begin_stop(&self) -> Transition {
        let mut state = self.lock();
        let previous = *state;
        *state = LifecycleState::Stopped;
        match previous {
            LifecycleState::Running => Transition::Proceed,
            LifecycleState::Created | LifecycleState::Stopped => Transition::Noop,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        // A poisoned lock still holds a valid state value
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
