//! Worker process lifecycle states.

use std::fmt;

use uuid::Uuid;

/// Identifies one worker process for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Uuid);

impl WorkerId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle of a worker process.
///
/// ```text
/// CREATING → SPAWNING → READY ⇄ REQUEST_SENT
///                  │       │         │
///                  │       │         └→ TIMED_OUT ─┐
///                  └───────┴───────────────────────┴→ DYING → DEAD
/// ```
///
/// Every transition is one-way apart from READY ⇄ REQUEST_SENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Constructed, not yet started.
    Creating,
    /// Spawned; waiting for the ready marker.
    Spawning,
    /// Connected and idle.
    Ready,
    /// Serving exactly one request.
    RequestSent,
    /// The in-flight request overran its deadline.
    TimedOut,
    /// Being terminated.
    Dying,
    /// Terminated and cleaned up. Terminal.
    Dead,
}

impl WorkerState {
    /// States in which `destroy` has nothing to do.
    #[must_use]
    pub const fn is_undestroyable(self) -> bool {
        matches!(self, Self::Creating | Self::Dying | Self::Dead)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "CREATING",
            Self::Spawning => "SPAWNING",
            Self::Ready => "READY",
            Self::RequestSent => "REQUEST_SENT",
            Self::TimedOut => "TIMED_OUT",
            Self::Dying => "DYING",
            Self::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// A state transition published to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub worker_id: WorkerId,
    pub state: WorkerState,
}
