//! # Sorter Run State
//!
//! ## Responsibility
//! Track whether the sorter is allowed to take new parcels.
//!
//! ```text
//! Ready ──start──► Running ◄──resume── Paused
//!                     └──────pause──────►┘
//! any ──emergency_stop──► EmergencyStop ──reset──► Ready
//! Running | Paused ──stop──► Ready
//! ```
//!
//! ## Guarantees
//! - Parcel creation is allowed only while `Running`
//! - Illegal transitions return an error and leave the state unchanged
//!
//! ## NOT Responsible For
//! - Stopping hardware (drivers react to their own state feed)

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Whether a new parcel may be created, and why not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreationVerdict {
    /// Creation is allowed.
    pub allowed: bool,
    /// Why creation was refused.
    pub reason: Option<String>,
}

impl CreationVerdict {
    /// Creation allowed.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Creation refused.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether the sorter currently accepts parcels.
pub trait RunStateValidator: Send + Sync {
    /// Check whether a parcel may be created now.
    fn validate_parcel_creation(&self) -> CreationVerdict;
}

/// Sorter operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    /// Powered and idle.
    Ready,
    /// Sorting.
    Running,
    /// Belt held; parcels are not accepted.
    Paused,
    /// Hardware stop latched until reset.
    EmergencyStop,
}

/// A transition not permitted from the current state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {action} while {from:?}")]
pub struct RunStateError {
    /// State the transition was attempted from.
    pub from: RunState,
    /// Attempted transition.
    pub action: &'static str,
}

/// [`RunStateValidator`] backed by an in-process state machine.
pub struct SystemRunState {
    state: Mutex<RunState>,
}

impl Default for SystemRunState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRunState {
    /// Start in `Ready`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Ready),
        }
    }

    /// Start already `Running`.
    pub fn running() -> Self {
        Self {
            state: Mutex::new(RunState::Running),
        }
    }

    /// Current state.
    pub fn current(&self) -> RunState {
        *self.state.lock()
    }

    /// `Ready → Running`.
    pub fn start(&self) -> Result<RunState, RunStateError> {
        self.transition("start", |s| matches!(s, RunState::Ready), RunState::Running)
    }

    /// `Running → Paused`.
    pub fn pause(&self) -> Result<RunState, RunStateError> {
        self.transition("pause", |s| matches!(s, RunState::Running), RunState::Paused)
    }

    /// `Paused → Running`.
    pub fn resume(&self) -> Result<RunState, RunStateError> {
        self.transition("resume", |s| matches!(s, RunState::Paused), RunState::Running)
    }

    /// `Running | Paused → Ready`.
    pub fn stop(&self) -> Result<RunState, RunStateError> {
        self.transition(
            "stop",
            |s| matches!(s, RunState::Running | RunState::Paused),
            RunState::Ready,
        )
    }

    /// Any state → `EmergencyStop`.
    pub fn emergency_stop(&self) -> RunState {
        let mut state = self.state.lock();
        warn!(from = ?*state, "emergency stop latched");
        *state = RunState::EmergencyStop;
        *state
    }

    /// `EmergencyStop → Ready`.
    pub fn reset(&self) -> Result<RunState, RunStateError> {
        self.transition("reset", |s| matches!(s, RunState::EmergencyStop), RunState::Ready)
    }

    fn transition(
        &self,
        action: &'static str,
        permitted: impl Fn(RunState) -> bool,
        to: RunState,
    ) -> Result<RunState, RunStateError> {
        let mut state = self.state.lock();
        if !permitted(*state) {
            return Err(RunStateError {
                from: *state,
                action,
            });
        }
        info!(from = ?*state, to = ?to, "run state changed");
        *state = to;
        Ok(to)
    }
}

impl RunStateValidator for SystemRunState {
    fn validate_parcel_creation(&self) -> CreationVerdict {
        match self.current() {
            RunState::Running => CreationVerdict::allow(),
            other => CreationVerdict::deny(format!("sorter is {other:?}")),
        }
    }
}
