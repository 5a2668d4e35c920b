//! Reorder buffer phases as a pure transition function.
//!
//! ```text
//!   Idle ─► Accepting ─► Checking ─► Committing ─► Normalizing ─► Draining ─► Idle
//!              ▲            │            │
//!              └────────────┴────────────┘ (nothing contiguous / vector incomplete)
//!
//!   any ── Fault ──► ErrorRecovery ── Recovered ──► Idle
//!   any ── Flush ──► Idle
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReorderPhase {
    #[default]
    Idle,
    Accepting,
    Checking,
    Committing,
    Normalizing,
    Draining,
    ErrorRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderEvent {
    ResultArrived,
    /// Admission finished; scan for contiguous completions.
    Check,
    /// A contiguous run (or a forced commit) is ready.
    CommitReady,
    NothingToCommit,
    /// Commit pass finished; `complete` when the vector is fully valid.
    Committed { complete: bool },
    Normalized,
    Drained,
    Fault,
    Recovered,
    Flush,
}

impl ReorderPhase {
    /// Next phase for `event`. Events that do not apply leave the phase unchanged.
    pub fn next(self, event: ReorderEvent) -> ReorderPhase {
        use ReorderEvent as E;
        use ReorderPhase as P;
        match (self, event) {
            (_, E::Flush) => P::Idle,
            (_, E::Fault) => P::ErrorRecovery,
            (P::ErrorRecovery, E::Recovered) => P::Idle,
            (P::ErrorRecovery, _) => P::ErrorRecovery,

            (P::Idle | P::Accepting | P::Checking, E::ResultArrived) => P::Accepting,
            (P::Idle | P::Accepting, E::Check) => P::Checking,
            (P::Checking, E::CommitReady) => P::Committing,
            (P::Checking, E::NothingToCommit) => P::Accepting,
            (P::Committing, E::Committed { complete: true }) => P::Normalizing,
            (P::Committing, E::Committed { complete: false }) => P::Accepting,
            (P::Normalizing, E::Normalized) => P::Draining,
            (P::Draining, E::Drained) => P::Idle,

            (phase, _) => phase,
        }
    }

    /// Phases in which new results may be written into slots.
    pub fn admits_results(self) -> bool {
        matches!(
            self,
            ReorderPhase::Idle | ReorderPhase::Accepting | ReorderPhase::Checking
        )
    }
}
