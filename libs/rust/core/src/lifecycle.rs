//! Gateway bootstrap state machine.
//!
//! Phases:
//! - Connecting (cluster transport)
//! - LoadingModels (initial model snapshot)
//! - Announcing (providers registered)
//! - Operational
//!
//! Tracks how long each phase took and flips readiness when operational.

use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootstrapPhase { Connecting, LoadingModels, Announcing, Operational }

#[derive(Debug)]
pub struct BootstrapState {
    phase: BootstrapPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(BootstrapPhase, Duration)>,
}

impl BootstrapState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { phase: BootstrapPhase::Connecting, started_at: now, phase_started_at: now, phase_durations: Vec::new() }
    }

    pub fn phase(&self) -> BootstrapPhase { self.phase }

    pub fn advance(&mut self) {
        let now = Instant::now();
        let dur = now - self.phase_started_at;
        self.phase_durations.push((self.phase, dur));
        let next = match self.phase {
            BootstrapPhase::Connecting => BootstrapPhase::LoadingModels,
            BootstrapPhase::LoadingModels => BootstrapPhase::Announcing,
            BootstrapPhase::Announcing | BootstrapPhase::Operational => BootstrapPhase::Operational,
        };
        info!(from = ?self.phase, to = ?next, elapsed_ms = dur.as_millis() as u64, "bootstrap_phase_advanced");
        self.phase = next;
        self.phase_started_at = now;
        if self.is_ready() { crate::mark_ready(); }
    }

    pub fn is_ready(&self) -> bool { self.phase == BootstrapPhase::Operational }

    pub fn durations(&self) -> &[(BootstrapPhase, Duration)] { &self.phase_durations }

    pub fn total(&self) -> Duration { self.started_at.elapsed() }
}

impl Default for BootstrapState {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_progresses() {
        let mut st = BootstrapState::new();
        assert_eq!(st.phase(), BootstrapPhase::Connecting);
        st.advance();
        st.advance();
        assert!(!st.is_ready());
        st.advance();
        assert!(st.is_ready());
        st.advance();
        assert_eq!(st.phase(), BootstrapPhase::Operational);
        assert_eq!(st.durations().len(), 4);
        assert!(crate::is_ready());
    }
}
