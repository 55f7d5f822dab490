//! Service startup finite state machine.
//!
//! Phases:
//! - LedgerInit
//! - ModelLoad
//! - InitialRetrain
//! - Serving
//!
//! Tracks how long each phase took and offers readiness evaluation.

use std::time::{Instant, Duration};
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase { LedgerInit, ModelLoad, InitialRetrain, Serving }

impl StartupPhase {
    pub fn as_str(&self) -> &'static str {
        match self { StartupPhase::LedgerInit => "ledger_init", StartupPhase::ModelLoad => "model_load", StartupPhase::InitialRetrain => "initial_retrain", StartupPhase::Serving => "serving" }
    }
}

#[derive(Debug)]
pub struct StartupState {
    phase: StartupPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(StartupPhase, Duration)>,
}

impl Default for StartupState {
    fn default() -> Self { Self::new() }
}

impl StartupState {
    pub fn new() -> Self { Self { phase: StartupPhase::LedgerInit, started_at: Instant::now(), phase_started_at: Instant::now(), phase_durations: Vec::new() } }
    pub fn phase(&self) -> StartupPhase { self.phase }
    pub fn advance(&mut self) -> StartupPhase {
        let now = Instant::now();
        self.phase_durations.push((self.phase, now - self.phase_started_at));
        self.phase = match self.phase { StartupPhase::LedgerInit => StartupPhase::ModelLoad, StartupPhase::ModelLoad => StartupPhase::InitialRetrain, StartupPhase::InitialRetrain => StartupPhase::Serving, StartupPhase::Serving => StartupPhase::Serving };
        self.phase_started_at = now;
        crate::set_status_detail("startup_phase", self.phase.as_str());
        self.phase
    }
    pub fn is_ready(&self) -> bool { self.phase == StartupPhase::Serving }
    pub fn elapsed(&self) -> Duration { self.started_at.elapsed() }
    pub fn durations(&self) -> &[(StartupPhase, Duration)] { &self.phase_durations }
}
