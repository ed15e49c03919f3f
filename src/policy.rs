//! Escalation policy.
//!
//! State machine over one exam attempt:
//!
//! ```text
//! DISARMED --arm--> ARMED_CLEAN --violation--> ARMED_WARNED(n) --budget spent--> DISQUALIFIED
//!    ^                  |                            |
//!    +------disarm------+----------------------------+        (terminal severity: any ARMED_* --> DISQUALIFIED)
//! ```
//!
//! Each transition reads and writes the session state inside a single `&mut self` call
//! with no I/O. Ledger commands and the user-facing notice are handed back in a
//! [`Transition`] so the caller dispatches them only after the decision is final.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerCommand, ViolationRecord};
use crate::notice::Notice;
use crate::permissions::TrackKind;
use crate::{SessionId, Severity, UserId, Violation, MAX_VIOLATIONS_REASON, MAX_WARNINGS};

/// Budget cost of each non-terminal severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub warning: u32,
    pub critical: u32,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            warning: 1,
            critical: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    pub max_warnings: u32,
    pub weights: SeverityWeights,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_warnings: MAX_WARNINGS,
            weights: SeverityWeights::default(),
        }
    }
}

impl PolicyConfig {
    /// `None` for `Terminal`: terminal violations bypass the budget.
    pub fn weight(&self, severity: Severity) -> Option<u32> {
        match severity {
            Severity::Warning => Some(self.weights.warning),
            Severity::Critical => Some(self.weights.critical),
            Severity::Terminal => None,
        }
    }
}

/// Live capture and display capabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub camera_granted: bool,
    pub microphone_granted: bool,
    pub is_fullscreen: bool,
}

/// Outcome of a disqualifying transition, handed to the one-shot callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Disqualification {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub reason: String,
    pub violation_count: u32,
    pub completed_at: u64,
}

/// Integrity state of one exam attempt. Only [`EscalationPolicy`] mutates it.
#[derive(Clone, Debug)]
pub struct SessionIntegrityState {
    session_id: SessionId,
    user_id: UserId,
    violation_count: u32,
    is_disqualified: bool,
    armed: bool,
    capabilities: Capabilities,
    disqualification: Option<Disqualification>,
}

impl SessionIntegrityState {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn violation_count(&self) -> u32 {
        self.violation_count
    }

    pub fn is_disqualified(&self) -> bool {
        self.is_disqualified
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn disqualification(&self) -> Option<&Disqualification> {
        self.disqualification.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyPhase {
    Disarmed,
    ArmedClean,
    ArmedWarned(u32),
    Disqualified,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    NotArmed,
    AlreadyDisqualified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Ignored(IgnoreReason),
    Warned {
        violation: Violation,
        weight: u32,
        violation_count: u32,
        max_warnings: u32,
    },
    Disqualified {
        violation: Violation,
        disqualification: Disqualification,
    },
}

impl Decision {
    pub fn is_disqualification(&self) -> bool {
        matches!(self, Decision::Disqualified { .. })
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Decision::Ignored(_))
    }

    pub fn violation_count(&self) -> Option<u32> {
        match self {
            Decision::Ignored(_) => None,
            Decision::Warned {
                violation_count, ..
            } => Some(*violation_count),
            Decision::Disqualified {
                disqualification, ..
            } => Some(disqualification.violation_count),
        }
    }
}

/// Result of feeding one violation to the policy.
#[derive(Clone, Debug)]
pub struct Transition {
    pub decision: Decision,
    pub ledger: Vec<LedgerCommand>,
    pub notice: Option<Notice>,
}

impl Transition {
    fn ignored(reason: IgnoreReason) -> Self {
        Self {
            decision: Decision::Ignored(reason),
            ledger: Vec::new(),
            notice: None,
        }
    }
}

/// Read-only projection of the integrity state for UI indicators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegritySnapshot {
    pub violation_count: u32,
    pub max_warnings: u32,
    pub is_disqualified: bool,
    pub armed: bool,
    pub camera_granted: bool,
    pub microphone_granted: bool,
    pub is_fullscreen: bool,
}

impl IntegritySnapshot {
    /// Percentage rating shown next to the warning counter.
    pub fn integrity_score(&self) -> u32 {
        let step = 100 / self.max_warnings.max(1);
        100u32.saturating_sub(self.violation_count.saturating_mul(step))
    }

    /// Camera, microphone and fullscreen are all held.
    pub fn ready_to_start(&self) -> bool {
        self.camera_granted && self.microphone_granted && self.is_fullscreen
    }
}

pub struct EscalationPolicy {
    config: PolicyConfig,
    capabilities: Capabilities,
    session: Option<SessionIntegrityState>,
}

impl EscalationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            capabilities: Capabilities::default(),
            session: None,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn state(&self) -> Option<&SessionIntegrityState> {
        self.session.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.armed)
    }

    pub fn phase(&self) -> PolicyPhase {
        match &self.session {
            Some(s) if s.is_disqualified => PolicyPhase::Disqualified,
            Some(s) if s.armed && s.violation_count == 0 => PolicyPhase::ArmedClean,
            Some(s) if s.armed => PolicyPhase::ArmedWarned(s.violation_count),
            _ => PolicyPhase::Disarmed,
        }
    }

    /// `DISARMED -> ARMED_CLEAN` with a fresh state for `session_id`.
    pub fn arm(&mut self, session_id: SessionId, user_id: UserId) -> Result<()> {
        if let Some(state) = &self.session {
            if state.armed {
                return Err(anyhow!(
                    "session {} is already armed; disarm it first",
                    state.session_id
                ));
            }
            if state.is_disqualified && state.session_id == session_id {
                return Err(anyhow!(
                    "session {} was disqualified and cannot be re-armed",
                    session_id
                ));
            }
        }
        self.session = Some(SessionIntegrityState {
            session_id,
            user_id,
            violation_count: 0,
            is_disqualified: false,
            armed: true,
            capabilities: self.capabilities,
            disqualification: None,
        });
        Ok(())
    }

    /// `ARMED_* -> DISARMED` on normal completion. Returns false when nothing was armed.
    pub fn disarm(&mut self) -> bool {
        match self.session.as_mut() {
            Some(state) if state.armed => {
                state.armed = false;
                true
            }
            _ => false,
        }
    }

    pub fn apply(&mut self, violation: Violation, now_s: u64) -> Transition {
        let config = self.config;
        let Some(state) = self.session.as_mut() else {
            return Transition::ignored(IgnoreReason::NotArmed);
        };
        if state.is_disqualified {
            return Transition::ignored(IgnoreReason::AlreadyDisqualified);
        }
        if !state.armed {
            return Transition::ignored(IgnoreReason::NotArmed);
        }

        let weight = config.weight(violation.severity);
        let record = ViolationRecord::new(
            &state.session_id,
            &state.user_id,
            &violation,
            weight.unwrap_or(0),
            now_s,
        );
        let mut ledger = vec![LedgerCommand::AppendViolation(record)];

        let reason = match weight {
            None => violation.description.clone(),
            Some(weight) => {
                state.violation_count = state.violation_count.saturating_add(weight);
                ledger.push(LedgerCommand::UpdateViolationCount {
                    session_id: state.session_id.clone(),
                    count: state.violation_count,
                });
                if state.violation_count < config.max_warnings {
                    let notice = Notice::Warning {
                        severity: violation.severity,
                        description: violation.description.clone(),
                        violation_count: state.violation_count,
                        max_warnings: config.max_warnings,
                    };
                    return Transition {
                        decision: Decision::Warned {
                            violation,
                            weight,
                            violation_count: state.violation_count,
                            max_warnings: config.max_warnings,
                        },
                        ledger,
                        notice: Some(notice),
                    };
                }
                MAX_VIOLATIONS_REASON.to_string()
            }
        };

        state.is_disqualified = true;
        state.armed = false;
        let disqualification = Disqualification {
            session_id: state.session_id.clone(),
            user_id: state.user_id.clone(),
            reason: reason.clone(),
            violation_count: state.violation_count,
            completed_at: now_s,
        };
        state.disqualification = Some(disqualification.clone());
        ledger.push(LedgerCommand::MarkDisqualified {
            session_id: state.session_id.clone(),
            reason: reason.clone(),
            completed_at: now_s,
        });

        Transition {
            decision: Decision::Disqualified {
                violation,
                disqualification,
            },
            ledger,
            notice: Some(Notice::Terminated { reason }),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_media_grants(&mut self, camera: bool, microphone: bool) {
        self.capabilities.camera_granted = camera;
        self.capabilities.microphone_granted = microphone;
        self.sync_capabilities();
    }

    /// Returns the previous fullscreen flag.
    pub fn set_fullscreen(&mut self, active: bool) -> bool {
        let previous = self.capabilities.is_fullscreen;
        self.capabilities.is_fullscreen = active;
        self.sync_capabilities();
        previous
    }

    pub fn revoke_track(&mut self, kind: TrackKind) {
        match kind {
            TrackKind::Video => self.capabilities.camera_granted = false,
            TrackKind::Audio => self.capabilities.microphone_granted = false,
        }
        self.sync_capabilities();
    }

    fn sync_capabilities(&mut self) {
        if let Some(state) = self.session.as_mut() {
            state.capabilities = self.capabilities;
        }
    }

    pub fn snapshot(&self) -> IntegritySnapshot {
        let (violation_count, is_disqualified, armed) = self
            .session
            .as_ref()
            .map(|s| (s.violation_count, s.is_disqualified, s.armed))
            .unwrap_or((0, false, false));
        IntegritySnapshot {
            violation_count,
            max_warnings: self.config.max_warnings,
            is_disqualified,
            armed,
            camera_granted: self.capabilities.camera_granted,
            microphone_granted: self.capabilities.microphone_granted,
            is_fullscreen: self.capabilities.is_fullscreen,
        }
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}
