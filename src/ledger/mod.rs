//! Integrity ledger client.
//!
//! The policy hands its ledger commands to a [`LedgerClient`] only after the local
//! decision is final. The client never reports failure back: errors are logged and
//! counted, then dropped. Nothing is retried inline.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::{lock_or_recover, AuditableError, SessionId, Severity, UserId, Violation, ViolationKind};

pub mod mqtt;
pub mod sqlite;

pub const LEDGER_DUPLICATE_DISQUALIFICATION: &str = "LEDGER_DUPLICATE_DISQUALIFICATION";

/// One violation as persisted by the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViolationRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub description: String,
    /// Budget weight charged for this violation (0 for terminal).
    pub weight: u32,
    pub recorded_at: u64,
}

impl ViolationRecord {
    pub fn new(
        session_id: &SessionId,
        user_id: &UserId,
        violation: &Violation,
        weight: u32,
        recorded_at: u64,
    ) -> Self {
        Self {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            kind: violation.kind,
            severity: violation.severity,
            description: violation.description.clone(),
            weight,
            recorded_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCommand {
    AppendViolation(ViolationRecord),
    UpdateViolationCount {
        session_id: SessionId,
        count: u32,
    },
    MarkDisqualified {
        session_id: SessionId,
        reason: String,
        completed_at: u64,
    },
}

impl LedgerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerCommand::AppendViolation(_) => "append_violation",
            LedgerCommand::UpdateViolationCount { .. } => "update_violation_count",
            LedgerCommand::MarkDisqualified { .. } => "mark_disqualified",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            LedgerCommand::AppendViolation(record) => &record.session_id,
            LedgerCommand::UpdateViolationCount { session_id, .. } => session_id,
            LedgerCommand::MarkDisqualified { session_id, .. } => session_id,
        }
    }
}

/// Remote system of record for violations and session outcome.
pub trait IntegrityLedger: Send {
    fn append_violation(&mut self, record: &ViolationRecord) -> Result<()>;

    fn update_session_violation_count(&mut self, session_id: &SessionId, count: u32)
        -> Result<()>;

    /// Called at most once per session.
    fn mark_disqualified(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        completed_at: u64,
    ) -> Result<()>;

    fn apply(&mut self, command: &LedgerCommand) -> Result<()> {
        match command {
            LedgerCommand::AppendViolation(record) => self.append_violation(record),
            LedgerCommand::UpdateViolationCount { session_id, count } => {
                self.update_session_violation_count(session_id, *count)
            }
            LedgerCommand::MarkDisqualified {
                session_id,
                reason,
                completed_at,
            } => self.mark_disqualified(session_id, reason, *completed_at),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub dispatched: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    dispatched: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> LedgerStats {
        LedgerStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

fn apply_logged(ledger: &mut dyn IntegrityLedger, command: &LedgerCommand, stats: &StatCounters) {
    match ledger.apply(command) {
        Ok(()) => {
            stats.written.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "ledger {} for session {} failed: {:#}",
                command.kind(),
                command.session_id(),
                e
            );
        }
    }
}

enum Delivery {
    Inline(Mutex<Box<dyn IntegrityLedger>>),
    Worker {
        tx: Mutex<Option<mpsc::Sender<LedgerCommand>>>,
        handle: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Fire-and-forget front of an [`IntegrityLedger`].
pub struct LedgerClient {
    delivery: Delivery,
    stats: Arc<StatCounters>,
}

impl LedgerClient {
    /// Writes on a background thread in dispatch order.
    pub fn spawn(ledger: Box<dyn IntegrityLedger>) -> Result<Self> {
        let stats = Arc::new(StatCounters::default());
        let (tx, rx) = mpsc::channel::<LedgerCommand>();
        let worker_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name("proctor-ledger".to_string())
            .spawn(move || {
                let mut ledger = ledger;
                for command in rx {
                    apply_logged(ledger.as_mut(), &command, &worker_stats);
                }
            })
            .map_err(|e| anyhow!("failed to spawn ledger worker: {}", e))?;
        Ok(Self {
            delivery: Delivery::Worker {
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            },
            stats,
        })
    }

    /// Writes on the dispatching thread, which for the controller means under its policy
    /// lock. Failures are still swallowed.
    pub fn inline(ledger: Box<dyn IntegrityLedger>) -> Self {
        Self {
            delivery: Delivery::Inline(Mutex::new(ledger)),
            stats: Arc::new(StatCounters::default()),
        }
    }

    pub fn dispatch(&self, command: LedgerCommand) {
        self.stats.dispatched.fetch_add(1, Ordering::SeqCst);
        match &self.delivery {
            Delivery::Inline(ledger) => {
                let mut guard = lock_or_recover(ledger);
                apply_logged(guard.as_mut(), &command, &self.stats);
            }
            Delivery::Worker { tx, .. } => {
                let sent = match lock_or_recover(tx).as_ref() {
                    Some(tx) => tx.send(command).map_err(|e| e.0),
                    None => Err(command),
                };
                if let Err(command) = sent {
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "ledger worker stopped; dropped {} for session {}",
                        command.kind(),
                        command.session_id()
                    );
                }
            }
        }
    }

    pub fn dispatch_all(&self, commands: impl IntoIterator<Item = LedgerCommand>) {
        for command in commands {
            self.dispatch(command);
        }
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats.snapshot()
    }

    /// Drains queued commands and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        if let Delivery::Worker { tx, handle } = &self.delivery {
            drop(lock_or_recover(tx).take());
            if let Some(handle) = lock_or_recover(handle).take() {
                if handle.join().is_err() {
                    log::warn!("ledger worker panicked");
                }
            }
        }
    }
}

impl Drop for LedgerClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// -------------------- In-Memory Ledger --------------------

#[derive(Default)]
struct InMemoryState {
    violations: Vec<ViolationRecord>,
    counts: BTreeMap<SessionId, u32>,
    disqualified: BTreeMap<SessionId, (String, u64)>,
    mark_attempts: u32,
    calls: u32,
    failing: Option<String>,
}

/// Ledger kept in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail with `reason` (unreachable store).
    pub fn set_failing(&self, reason: Option<&str>) {
        lock_or_recover(&self.state).failing = reason.map(str::to_string);
    }

    pub fn violations(&self) -> Vec<ViolationRecord> {
        lock_or_recover(&self.state).violations.clone()
    }

    pub fn violation_count(&self, session_id: &SessionId) -> Option<u32> {
        lock_or_recover(&self.state).counts.get(session_id).copied()
    }

    pub fn disqualification(&self, session_id: &SessionId) -> Option<(String, u64)> {
        lock_or_recover(&self.state)
            .disqualified
            .get(session_id)
            .cloned()
    }

    /// `mark_disqualified` calls received, including rejected ones.
    pub fn mark_attempts(&self) -> u32 {
        lock_or_recover(&self.state).mark_attempts
    }

    /// Total calls received, including failed ones.
    pub fn calls(&self) -> u32 {
        lock_or_recover(&self.state).calls
    }

    fn enter(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        let mut state = lock_or_recover(&self.state);
        state.calls += 1;
        if let Some(reason) = &state.failing {
            return Err(anyhow!("ledger unavailable: {}", reason));
        }
        Ok(state)
    }
}

impl IntegrityLedger for InMemoryLedger {
    fn append_violation(&mut self, record: &ViolationRecord) -> Result<()> {
        self.enter()?.violations.push(record.clone());
        Ok(())
    }

    fn update_session_violation_count(
        &mut self,
        session_id: &SessionId,
        count: u32,
    ) -> Result<()> {
        self.enter()?.counts.insert(session_id.clone(), count);
        Ok(())
    }

    fn mark_disqualified(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        completed_at: u64,
    ) -> Result<()> {
        let mut state = self.enter()?;
        state.mark_attempts += 1;
        if state.disqualified.contains_key(session_id) {
            return Err(AuditableError {
                code: LEDGER_DUPLICATE_DISQUALIFICATION,
                message: format!("session {} is already disqualified", session_id),
            }
            .into());
        }
        state
            .disqualified
            .insert(session_id.clone(), (reason.to_string(), completed_at));
        Ok(())
    }
}

// -------------------- Fan-out --------------------

/// Writes every command to each ledger in order. All ledgers are attempted; the first
/// failure is reported.
#[derive(Default)]
pub struct LedgerFanout {
    ledgers: Vec<Box<dyn IntegrityLedger>>,
}

impl LedgerFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ledger: Box<dyn IntegrityLedger>) {
        self.ledgers.push(ledger);
    }

    pub fn with(mut self, ledger: Box<dyn IntegrityLedger>) -> Self {
        self.push(ledger);
        self
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }
}

impl IntegrityLedger for LedgerFanout {
    fn append_violation(&mut self, record: &ViolationRecord) -> Result<()> {
        self.apply(&LedgerCommand::AppendViolation(record.clone()))
    }

    fn update_session_violation_count(
        &mut self,
        session_id: &SessionId,
        count: u32,
    ) -> Result<()> {
        self.apply(&LedgerCommand::UpdateViolationCount {
            session_id: session_id.clone(),
            count,
        })
    }

    fn mark_disqualified(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        completed_at: u64,
    ) -> Result<()> {
        self.apply(&LedgerCommand::MarkDisqualified {
            session_id: session_id.clone(),
            reason: reason.to_string(),
            completed_at,
        })
    }

    fn apply(&mut self, command: &LedgerCommand) -> Result<()> {
        let mut first_error = None;
        for ledger in self.ledgers.iter_mut() {
            if let Err(e) = ledger.apply(command) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    log::warn!("ledger fan-out: additional failure: {:#}", e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
