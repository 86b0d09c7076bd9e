//! Tracking session state management

use std::time::Instant;

/// Tracking session state machine
///
/// `Loading` covers the time between sending the load request and the worker's
/// end-of-loading notice. Captures are dispatched only while `Running`; the
/// display keeps advancing in every state but `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Markers may still be registered, nothing is running
    Idle,

    /// Waiting for the detection worker to load calibration and markers
    Loading,

    /// Capturing and detecting
    Running {
        /// When tracking started
        started_at: Instant,
    },

    /// Display continues, no captures are dispatched
    Paused {
        /// When tracking was paused
        paused_at: Instant,
    },

    /// Shutting down
    Stopping,

    /// Session is over and cannot be restarted
    Stopped,
}

impl PipelineState {
    /// Whether the session may move from this state to `target`.
    ///
    /// Stopping is reachable from every live state; a stopped session stays stopped.
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Stopped, _) => false,
            (_, Stopping) => true,
            (Stopping, Stopped) => true,
            (Idle, Loading) | (Loading, Running { .. }) => true,
            (Running { .. }, Paused { .. }) | (Paused { .. }, Running { .. }) => true,
            (a, b) => a == b,
        }
    }

    /// Whether new markers can still be registered
    pub fn accepts_registration(&self) -> bool {
        matches!(self, PipelineState::Idle)
    }

    /// Whether the display should keep advancing
    pub fn is_displaying(&self) -> bool {
        !matches!(self, PipelineState::Stopped | PipelineState::Stopping)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, PipelineState::Paused { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Stopping)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "Idle",
            PipelineState::Loading => "Loading",
            PipelineState::Running { .. } => "Running",
            PipelineState::Paused { .. } => "Paused",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}
