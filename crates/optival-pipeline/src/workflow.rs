//! Operator workflow state machine.
//!
//! The rig moves through a fixed set of phases: capture views, run the
//! optimization in the background, review the quality report, then
//! measure with the adopted calibration. The machine is deliberately
//! external to the phase implementations ([`crate::capture`],
//! [`crate::calibrate`], ...): it decides which operations are allowed
//! right now, while the data those operations produce lives elsewhere
//! (notably [`crate::quality::ActiveCalibration`], which keeps the
//! last adopted result across rejected runs, faults, and resets).
//!
//! Routine navigation dropouts are not workflow faults: the caller
//! simply stops feeding samples to the validator until the device
//! returns. [`WorkflowEvent::DeviceFault`] is for losses that need an
//! operator, a camera going dark mid-capture for instance.

use log::info;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// Nothing in progress.
    Idle,
    /// Collecting calibration views.
    Capturing,
    /// Background optimization running.
    Calibrating,
    /// Quality report ready, waiting for the operator's verdict.
    Review,
    /// A calibration is adopted; the rig measures.
    Active,
    /// A device fault needs operator attention.
    Faulted,
}

impl WorkflowState {
    /// Electrode measurements are only meaningful with an adopted
    /// calibration.
    pub fn allows_measurement(self) -> bool {
        self == Self::Active
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Calibrating => "calibrating",
            Self::Review => "review",
            Self::Active => "active",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    BeginSession,
    FinalizeSession,
    OptimizationFinished,
    OptimizationFailed,
    AdoptResult,
    Reject,
    DeviceFault,
    Reset,
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeginSession => "begin session",
            Self::FinalizeSession => "finalize session",
            Self::OptimizationFinished => "optimization finished",
            Self::OptimizationFailed => "optimization failed",
            Self::AdoptResult => "adopt result",
            Self::Reject => "reject",
            Self::DeviceFault => "device fault",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("cannot apply '{event}' in state '{from}'")]
    InvalidTransition {
        from: WorkflowState,
        event: WorkflowEvent,
    },
}

fn transition(from: WorkflowState, event: WorkflowEvent) -> Option<WorkflowState> {
    use WorkflowEvent as E;
    use WorkflowState as S;
    match (from, event) {
        (_, E::DeviceFault) => Some(S::Faulted),
        (S::Idle, E::BeginSession) => Some(S::Capturing),
        (S::Capturing, E::FinalizeSession) => Some(S::Calibrating),
        (S::Calibrating, E::OptimizationFinished) => Some(S::Review),
        // A failed run sends the operator back for more views; an
        // earlier adopted calibration stays in force meanwhile.
        (S::Calibrating, E::OptimizationFailed) => Some(S::Capturing),
        (S::Review, E::AdoptResult) => Some(S::Active),
        (S::Review, E::Reject) => Some(S::Capturing),
        // Recalibration starts a fresh session while measurements
        // keep running on the adopted result until adoption replaces it.
        (S::Active, E::BeginSession) => Some(S::Capturing),
        (S::Faulted, E::Reset) => Some(S::Idle),
        _ => None,
    }
}

/// Current phase of the rig, advanced by [`Workflow::apply`].
#[derive(Debug)]
pub struct Workflow {
    state: WorkflowState,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Apply `event`, returning the new state. Disallowed events leave
    /// the state untouched.
    pub fn apply(&mut self, event: WorkflowEvent) -> Result<WorkflowState, WorkflowError> {
        match transition(self.state, event) {
            Some(next) => {
                info!("workflow: {} --[{}]--> {}", self.state, event, next);
                self.state = next;
                Ok(next)
            }
            None => Err(WorkflowError::InvalidTransition {
                from: self.state,
                event,
            }),
        }
    }
}
