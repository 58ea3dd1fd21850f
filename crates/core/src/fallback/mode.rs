use serde::{Deserialize, Serialize};

/// Which backend is authoritative right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    #[default]
    PrimaryUp,
    Degraded,
    /// Primary is reachable again and queued writes are being replayed.
    Reconciling,
}

/// Inputs that drive the fallback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSignal {
    ProbeFailed,
    ProbeSucceeded,
    QueueDrained,
    ReplayFailed,
}

impl FallbackMode {
    /// Returns the mode after `signal`.
    ///
    /// With `pinned` set (persistent fallback) the machine stays in
    /// [`FallbackMode::Degraded`] whatever happens.
    ///
    /// # Examples
    ///
    /// ```
    /// use kvguard_core::fallback::{FallbackMode, FallbackSignal};
    ///
    /// let mode = FallbackMode::PrimaryUp.transition(FallbackSignal::ProbeFailed, false);
    /// assert_eq!(mode, FallbackMode::Degraded);
    /// let mode = mode.transition(FallbackSignal::ProbeSucceeded, false);
    /// assert_eq!(mode, FallbackMode::Reconciling);
    /// ```
    pub fn transition(self, signal: FallbackSignal, pinned: bool) -> FallbackMode {
        use FallbackMode::*;
        use FallbackSignal::*;

        if pinned {
            return Degraded;
        }
        match (self, signal) {
            (PrimaryUp | Reconciling, ProbeFailed) => Degraded,
            (Degraded, ProbeSucceeded) => Reconciling,
            (Reconciling, QueueDrained) => PrimaryUp,
            (Reconciling, ReplayFailed) => Degraded,
            (mode, _) => mode,
        }
    }

    /// Returns true when reads and writes should go to the primary first.
    pub fn primary_authoritative(self) -> bool {
        self == FallbackMode::PrimaryUp
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FallbackMode::PrimaryUp => "primary_up",
            FallbackMode::Degraded => "degraded",
            FallbackMode::Reconciling => "reconciling",
        }
    }
}
