//! Phase State Machine.
//!
//! The authoritative per-session workflow state. Every phase mutation goes
//! through [`PhaseMachine::transition`], which rejects edges that are not in
//! the table below:
//!
//! ```text
//! idle ──────────> planning ──> awaiting_approval ──> coding ──> verifying ──> complete
//!   │                 ^  │             │                ^  │                      │
//!   │                 └──┘ (retry)     └──> planning    │  └──> complete (fast)   │
//!   └──────────────────────────────────────────────────>┘                         │
//!                         complete ──> planning | coding <────────────────────────┘
//! ```
//!
//! Any phase may be reset to `idle` explicitly; failures never reset it
//! automatically.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::OrchestratorError;

use super::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    AwaitingApproval,
    Coding,
    Verifying,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Coding => "coding",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
        }
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        if next == Idle {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Planning)
                | (Idle, Coding)
                | (Planning, Planning)
                | (Planning, AwaitingApproval)
                | (AwaitingApproval, Planning)
                | (AwaitingApproval, Coding)
                | (Coding, Coding)
                | (Coding, Verifying)
                | (Coding, Complete)
                | (Verifying, Complete)
                | (Complete, Planning)
                | (Complete, Coding)
        )
    }

    /// Phases from which a fresh direct-execution run (fast or repair) may start.
    pub fn accepts_direct_run(self) -> bool {
        self.can_transition_to(Phase::Coding) && self != Phase::AwaitingApproval
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "coding" => Ok(Self::Coding),
            "verifying" => Ok(Self::Verifying),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Validates and persists phase transitions.
#[derive(Clone)]
pub struct PhaseMachine {
    store: Arc<dyn SessionStore>,
}

impl PhaseMachine {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn current(&self, session: &str) -> Result<Phase, OrchestratorError> {
        self.store
            .get_phase(session)
            .await
            .map_err(OrchestratorError::Store)
    }

    /// Move `session` to `to`, returning the phase it left.
    pub async fn transition(&self, session: &str, to: Phase) -> Result<Phase, OrchestratorError> {
        let from = self.current(session).await?;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                session: session.to_string(),
                from,
                to,
            });
        }
        self.store
            .set_phase(session, to)
            .await
            .map_err(OrchestratorError::Store)?;
        debug!(session, %from, %to, "phase transition");
        Ok(from)
    }

    /// Abandon whatever the session was doing.
    pub async fn reset(&self, session: &str) -> Result<Phase, OrchestratorError> {
        self.transition(session, Phase::Idle).await
    }
}
