//! Per-invocation time limits for external commands.
//!
//! A hung child blocks its worker until it is killed, so each stage kind can
//! carry its own limit. No limit is applied unless one is configured.

use std::time::Duration;

use crate::artifacts::StageKind;

/// Time limits for the external commands run by each stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Limit for one transition-matrix extraction (single lag or batched).
    pub transition_matrix: Option<Duration>,

    /// Limit for one solver phase (equilibration or production).
    pub solver: Option<Duration>,
}

impl TimeoutConfig {
    /// Creates a TimeoutConfig without any limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transition-matrix extraction limit.
    pub fn with_transition_matrix_timeout(mut self, timeout: Duration) -> Self {
        self.transition_matrix = Some(timeout);
        self
    }

    /// Sets the solver phase limit.
    pub fn with_solver_timeout(mut self, timeout: Duration) -> Self {
        self.solver = Some(timeout);
        self
    }

    /// The limit that applies to invocations made by `stage`.
    pub fn for_stage(&self, stage: StageKind) -> Option<Duration> {
        match stage {
            StageKind::TransitionMatrix => self.transition_matrix,
            StageKind::Equilibration | StageKind::Production => self.solver,
        }
    }
}
