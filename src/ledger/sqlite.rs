//! Sealed local ledger.
//!
//! Every command becomes one row in `ledger_entries`, hash-chained to the row before it
//! and signed with the device key. `session_outcomes` holds the current projection per
//! session and is what an exam runner reads back. The device public key is pinned in
//! `device_metadata` on first open; reopening with a different seed is refused.

use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{IntegrityLedger, ViolationRecord, LEDGER_DUPLICATE_DISQUALIFICATION};
use crate::chain::{seal_payload, GENESIS_HASH};
use crate::{now_s, open_db_connection, signing_key_from_seed, AuditableError, SessionId};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DISQUALIFIED: &str = "disqualified";
pub const EXAM_IN_PROGRESS: &str = "in_progress";
pub const EXAM_COMPLETED: &str = "completed";

/// Payload sealed into one `ledger_entries` row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LedgerEntry {
    Violation(ViolationRecord),
    ViolationCount {
        session_id: SessionId,
        count: u32,
        recorded_at: u64,
    },
    Disqualified {
        session_id: SessionId,
        reason: String,
        completed_at: u64,
    },
}

impl LedgerEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEntry::Violation(_) => "violation",
            LedgerEntry::ViolationCount { .. } => "violation_count",
            LedgerEntry::Disqualified { .. } => "disqualified",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            LedgerEntry::Violation(record) => &record.session_id,
            LedgerEntry::ViolationCount { session_id, .. } => session_id,
            LedgerEntry::Disqualified { session_id, .. } => session_id,
        }
    }
}

/// Current outcome row for one session.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub user_id: Option<String>,
    pub violation_count: u32,
    pub proctoring_status: String,
    pub status: String,
    pub reason: Option<String>,
    pub completed_at: Option<u64>,
}

impl SessionOutcome {
    pub fn is_disqualified(&self) -> bool {
        self.proctoring_status == STATUS_DISQUALIFIED
    }
}

pub struct SqliteLedger {
    conn: Connection,
    signing_key: SigningKey,
}

impl SqliteLedger {
    pub fn open(db_path: &str, device_key_seed: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let signing_key = signing_key_from_seed(device_key_seed)?;
        let mut ledger = Self { conn, signing_key };
        ledger.ensure_schema()?;
        ledger.ensure_device_public_key()?;
        Ok(ledger)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              session_id TEXT NOT NULL,
              entry_kind TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL,
              signature BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_outcomes (
              session_id TEXT PRIMARY KEY,
              user_id TEXT,
              violation_count INTEGER NOT NULL DEFAULT 0,
              proctoring_status TEXT NOT NULL,
              status TEXT NOT NULL,
              reason TEXT,
              completed_at INTEGER,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_metadata (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              public_key BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conformance_alarms (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              code TEXT NOT NULL,
              message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_entries_session ON ledger_entries(session_id);
            "#,
        )?;
        Ok(())
    }

    fn ensure_device_public_key(&mut self) -> Result<()> {
        let key_bytes = self.signing_key.verifying_key().to_bytes();
        let existing: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT public_key FROM device_metadata WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(bytes) = existing {
            if bytes.len() != 32 {
                return Err(anyhow!(
                    "corrupt device_metadata.public_key: expected 32 bytes, got {}",
                    bytes.len()
                ));
            }
            if bytes.as_slice() != key_bytes.as_slice() {
                return Err(AuditableError {
                    code: "LEDGER_DEVICE_KEY_MISMATCH",
                    message: "existing key does not match PROCTOR_DEVICE_KEY_SEED".to_string(),
                }
                .into());
            }
            return Ok(());
        }

        self.conn.execute(
            "INSERT INTO device_metadata (id, public_key) VALUES (1, ?1)",
            params![key_bytes.to_vec()],
        )?;
        Ok(())
    }

    /// Appends `entry` to the chain and runs `project` against the outcome table in the
    /// same transaction.
    fn seal<F>(&mut self, entry: &LedgerEntry, created_at: u64, project: F) -> Result<()>
    where
        F: FnOnce(&Connection, i64) -> Result<()>,
    {
        let created_at = to_i64(created_at, "created_at")?;
        let payload_json = serde_json::to_string(entry)?;
        let tx = self.conn.transaction()?;

        let prev_hash = last_entry_hash(&tx)?;
        let link = seal_payload(&self.signing_key, prev_hash, payload_json.as_bytes());
        tx.execute(
            r#"
            INSERT INTO ledger_entries(created_at, session_id, entry_kind, payload_json, prev_hash, entry_hash, signature)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                created_at,
                entry.session_id().as_str(),
                entry.kind(),
                payload_json,
                link.prev_hash.to_vec(),
                link.entry_hash.to_vec(),
                link.signature.to_vec()
            ],
        )?;
        project(&tx, created_at)?;
        tx.commit()?;
        Ok(())
    }

    fn log_alarm(&self, code: &str, message: &str) -> Result<()> {
        let created_at = to_i64(now_s()?, "created_at")?;
        self.conn.execute(
            "INSERT INTO conformance_alarms(created_at, code, message) VALUES (?1, ?2, ?3)",
            params![created_at, code, message],
        )?;
        Ok(())
    }

    pub fn session_outcome(&self, session_id: &SessionId) -> Result<Option<SessionOutcome>> {
        let outcome = self
            .conn
            .query_row(
                r#"
                SELECT session_id, user_id, violation_count, proctoring_status, status, reason, completed_at
                FROM session_outcomes WHERE session_id = ?1
                "#,
                params![session_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .optional()?;
        outcome.map(outcome_from_columns).transpose()
    }

    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl IntegrityLedger for SqliteLedger {
    fn append_violation(&mut self, record: &ViolationRecord) -> Result<()> {
        let entry = LedgerEntry::Violation(record.clone());
        let session_id = record.session_id.as_str().to_string();
        let user_id = record.user_id.as_str().to_string();
        self.seal(&entry, record.recorded_at, |conn, updated_at| {
            conn.execute(
                r#"
                INSERT INTO session_outcomes(session_id, user_id, violation_count, proctoring_status, status, updated_at)
                VALUES (?1, ?2, 0, ?3, ?4, ?5)
                ON CONFLICT(session_id) DO UPDATE SET
                  user_id = COALESCE(session_outcomes.user_id, excluded.user_id),
                  updated_at = excluded.updated_at
                "#,
                params![session_id, user_id, STATUS_ACTIVE, EXAM_IN_PROGRESS, updated_at],
            )?;
            Ok(())
        })
    }

    fn update_session_violation_count(
        &mut self,
        session_id: &SessionId,
        count: u32,
    ) -> Result<()> {
        let recorded_at = now_s()?;
        let entry = LedgerEntry::ViolationCount {
            session_id: session_id.clone(),
            count,
            recorded_at,
        };
        self.seal(&entry, recorded_at, |conn, updated_at| {
            conn.execute(
                r#"
                INSERT INTO session_outcomes(session_id, violation_count, proctoring_status, status, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id) DO UPDATE SET
                  violation_count = MAX(session_outcomes.violation_count, excluded.violation_count),
                  updated_at = excluded.updated_at
                "#,
                params![
                    session_id.as_str(),
                    i64::from(count),
                    STATUS_ACTIVE,
                    EXAM_IN_PROGRESS,
                    updated_at
                ],
            )?;
            Ok(())
        })
    }

    fn mark_disqualified(
        &mut self,
        session_id: &SessionId,
        reason: &str,
        completed_at: u64,
    ) -> Result<()> {
        if let Some(outcome) = self.session_outcome(session_id)? {
            if outcome.is_disqualified() {
                let message = format!("session {} is already disqualified", session_id);
                self.log_alarm(LEDGER_DUPLICATE_DISQUALIFICATION, &message)?;
                return Err(AuditableError {
                    code: LEDGER_DUPLICATE_DISQUALIFICATION,
                    message,
                }
                .into());
            }
        }

        let entry = LedgerEntry::Disqualified {
            session_id: session_id.clone(),
            reason: reason.to_string(),
            completed_at,
        };
        let completed = to_i64(completed_at, "completed_at")?;
        self.seal(&entry, completed_at, |conn, updated_at| {
            conn.execute(
                r#"
                INSERT INTO session_outcomes(session_id, violation_count, proctoring_status, status, reason, completed_at, updated_at)
                VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(session_id) DO UPDATE SET
                  proctoring_status = excluded.proctoring_status,
                  status = excluded.status,
                  reason = excluded.reason,
                  completed_at = excluded.completed_at,
                  updated_at = excluded.updated_at
                "#,
                params![
                    session_id.as_str(),
                    STATUS_DISQUALIFIED,
                    EXAM_COMPLETED,
                    reason,
                    completed,
                    updated_at
                ],
            )?;
            Ok(())
        })
    }
}

fn last_entry_hash(conn: &Connection) -> Result<[u8; 32]> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT entry_hash FROM ledger_entries ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match bytes {
        None => Ok(GENESIS_HASH),
        Some(bytes) => {
            if bytes.len() != 32 {
                return Err(anyhow!("corrupt ledger: entry_hash size"));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
    }
}

fn to_i64(value: u64, label: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", label))
}

pub(crate) type OutcomeColumns = (
    String,
    Option<String>,
    i64,
    String,
    String,
    Option<String>,
    Option<i64>,
);

pub(crate) fn outcome_from_columns(columns: OutcomeColumns) -> Result<SessionOutcome> {
    let (session_id, user_id, count, proctoring_status, status, reason, completed_at) = columns;
    let violation_count = u32::try_from(count)
        .map_err(|_| anyhow!("corrupt session_outcomes.violation_count: {}", count))?;
    let completed_at = completed_at
        .map(|t| {
            u64::try_from(t).map_err(|_| anyhow!("corrupt session_outcomes.completed_at: {}", t))
        })
        .transpose()?;
    Ok(SessionOutcome {
        session_id,
        user_id,
        violation_count,
        proctoring_status,
        status,
        reason,
        completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shared_memory_uri, Severity, UserId, Violation, ViolationKind};

    fn record(session: &SessionId, recorded_at: u64) -> ViolationRecord {
        ViolationRecord::new(
            session,
            &UserId::new("user-7").unwrap(),
            &Violation::new(
                ViolationKind::TabSwitch,
                Severity::Warning,
                "Tab switched or minimized",
            ),
            1,
            recorded_at,
        )
    }

    #[test]
    fn outcome_row_tracks_count_and_disqualification() -> Result<()> {
        let mut ledger = SqliteLedger::open(&shared_memory_uri(), "devkey:test")?;
        let session = SessionId::new("exam-1")?;

        ledger.append_violation(&record(&session, 100))?;
        ledger.update_session_violation_count(&session, 2)?;
        // stale count never lowers the stored one
        ledger.update_session_violation_count(&session, 1)?;

        let outcome = ledger.session_outcome(&session)?.expect("outcome row");
        assert_eq!(outcome.violation_count, 2);
        assert_eq!(outcome.user_id.as_deref(), Some("user-7"));
        assert_eq!(outcome.proctoring_status, STATUS_ACTIVE);

        ledger.mark_disqualified(&session, "Maximum violations exceeded", 200)?;
        let outcome = ledger.session_outcome(&session)?.expect("outcome row");
        assert!(outcome.is_disqualified());
        assert_eq!(outcome.status, EXAM_COMPLETED);
        assert_eq!(outcome.completed_at, Some(200));
        assert_eq!(outcome.reason.as_deref(), Some("Maximum violations exceeded"));
        assert_eq!(outcome.violation_count, 2);
        assert_eq!(ledger.entry_count()?, 4);
        Ok(())
    }

    #[test]
    fn second_disqualification_is_rejected_and_alarmed() -> Result<()> {
        let mut ledger = SqliteLedger::open(&shared_memory_uri(), "devkey:test")?;
        let session = SessionId::new("exam-2")?;
        ledger.mark_disqualified(&session, "Developer tools detected", 10)?;

        let err = ledger
            .mark_disqualified(&session, "Maximum violations exceeded", 11)
            .unwrap_err();
        let auditable = err.downcast_ref::<AuditableError>().expect("auditable");
        assert_eq!(auditable.code, LEDGER_DUPLICATE_DISQUALIFICATION);
        assert_eq!(ledger.entry_count()?, 1);

        let alarms: i64 = ledger.conn().query_row(
            "SELECT COUNT(*) FROM conformance_alarms WHERE code = ?1",
            params![LEDGER_DUPLICATE_DISQUALIFICATION],
            |row| row.get(0),
        )?;
        assert_eq!(alarms, 1);
        let outcome = ledger.session_outcome(&session)?.expect("outcome row");
        assert_eq!(outcome.reason.as_deref(), Some("Developer tools detected"));
        Ok(())
    }

    #[test]
    fn reopening_with_another_seed_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.db");
        let path = path.to_string_lossy().to_string();
        {
            let mut ledger = SqliteLedger::open(&path, "devkey:first")?;
            ledger.append_violation(&record(&SessionId::new("exam-3")?, 1))?;
        }
        assert!(SqliteLedger::open(&path, "devkey:first").is_ok());
        let err = match SqliteLedger::open(&path, "devkey:second") {
            Ok(_) => panic!("mismatched seed must be refused"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("LEDGER_DEVICE_KEY_MISMATCH"));
        Ok(())
    }

    #[test]
    fn entries_round_trip_through_json() {
        let entry = LedgerEntry::ViolationCount {
            session_id: SessionId::new("exam-4").unwrap(),
            count: 3,
            recorded_at: 9,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"entry\":\"violation_count\""));
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
