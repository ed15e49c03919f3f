use anyhow::{anyhow, Result};
use ed25519_dalek::VerifyingKey;
use rusqlite::{Connection, Row};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::ledger::sqlite::{outcome_from_columns, LedgerEntry, SessionOutcome};
use crate::{hash_entry, verify_entry_signature, GENESIS_HASH};

#[derive(Debug, Clone)]
pub struct AlarmEntry {
    pub created_at: i64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerReport {
    pub entries: u64,
    pub violations: u64,
    pub sessions: u64,
    pub disqualified_sessions: u64,
    pub alarms: u64,
}

pub fn count_alarms(conn: &Connection) -> Result<u64> {
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM conformance_alarms")?;
    let count: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn load_alarms(conn: &Connection) -> Result<Vec<AlarmEntry>> {
    let mut stmt =
        conn.prepare("SELECT created_at, code, message FROM conformance_alarms ORDER BY id ASC")?;
    let mut rows = stmt.query([])?;
    let mut alarms = Vec::new();
    while let Some(row) = rows.next()? {
        alarms.push(AlarmEntry {
            created_at: row.get(0)?,
            code: row.get(1)?,
            message: row.get(2)?,
        });
    }
    Ok(alarms)
}

pub fn load_session_outcomes(conn: &Connection) -> Result<Vec<SessionOutcome>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, user_id, violation_count, proctoring_status, status, reason, completed_at FROM session_outcomes ORDER BY session_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut outcomes = Vec::new();
    while let Some(row) = rows.next()? {
        outcomes.push(outcome_from_columns((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))?);
    }
    Ok(outcomes)
}

/// Re-walks the sealed chain from genesis: linkage, recomputed hash, device signature,
/// payload shape, and at most one disqualification per session.
pub fn verify_ledger_entries_with<F>(
    conn: &Connection,
    verifying_key: &VerifyingKey,
    mut on_entry: F,
) -> Result<u64>
where
    F: FnMut(i64, &LedgerEntry, [u8; 32]),
{
    let mut stmt = conn.prepare(
        "SELECT id, session_id, entry_kind, payload_json, prev_hash, entry_hash, signature FROM ledger_entries ORDER BY id ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut expected_prev = GENESIS_HASH;
    let mut disqualified = BTreeSet::new();
    let mut count = 0u64;

    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let session_id: String = row.get(1)?;
        let entry_kind: String = row.get(2)?;
        let payload: String = row.get(3)?;
        let prev_hash = blob32(row, 4)?;
        let entry_hash = blob32(row, 5)?;
        let sig = blob64(row, 6)?;

        if prev_hash != expected_prev {
            return Err(anyhow!(
                "integrity check failed at id {}: prev_hash={}, expected_prev={}",
                id,
                hex::encode(prev_hash),
                hex::encode(expected_prev)
            ));
        }

        let computed = hash_entry(&expected_prev, payload.as_bytes());
        if computed != entry_hash {
            return Err(anyhow!(
                "integrity check failed at id {}: computed_hash={}, stored_hash={}",
                id,
                hex::encode(computed),
                hex::encode(entry_hash)
            ));
        }

        if verify_entry_signature(verifying_key, &entry_hash, &sig).is_err() {
            return Err(anyhow!(
                "integrity check failed at id {}: signature mismatch (stored={})",
                id,
                hex::encode(sig)
            ));
        }

        let entry: LedgerEntry = serde_json::from_str(&payload)
            .map_err(|e| anyhow!("integrity check failed at id {}: bad payload: {}", id, e))?;
        if entry.session_id().as_str() != session_id || entry.kind() != entry_kind {
            return Err(anyhow!(
                "integrity check failed at id {}: row columns ({}, {}) do not match sealed payload ({}, {})",
                id,
                session_id,
                entry_kind,
                entry.session_id(),
                entry.kind()
            ));
        }
        if let LedgerEntry::Disqualified { session_id, .. } = &entry {
            if !disqualified.insert(session_id.clone()) {
                return Err(anyhow!(
                    "integrity check failed at id {}: session {} disqualified more than once",
                    id,
                    session_id
                ));
            }
        }

        on_entry(id, &entry, entry_hash);

        expected_prev = entry_hash;
        count += 1;
    }

    Ok(count)
}

/// Every session marked disqualified in `session_outcomes` has exactly one sealed
/// disqualification entry, and vice versa.
pub fn verify_single_disqualification(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT session_id, COUNT(*) FROM ledger_entries WHERE entry_kind = 'disqualified' GROUP BY session_id",
    )?;
    let mut rows = stmt.query([])?;
    let mut sealed = BTreeSet::new();
    while let Some(row) = rows.next()? {
        let session_id: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        if count != 1 {
            return Err(anyhow!(
                "session {} has {} disqualification entries",
                session_id,
                count
            ));
        }
        sealed.insert(session_id);
    }

    let marked: BTreeSet<String> = load_session_outcomes(conn)?
        .into_iter()
        .filter(|o| o.is_disqualified())
        .map(|o| o.session_id)
        .collect();
    if let Some(missing) = marked.difference(&sealed).next() {
        return Err(anyhow!(
            "session {} is marked disqualified without a sealed entry",
            missing
        ));
    }
    if let Some(unmarked) = sealed.difference(&marked).next() {
        return Err(anyhow!(
            "session {} has a sealed disqualification but its outcome row is not disqualified",
            unmarked
        ));
    }
    Ok(())
}

pub fn verify_ledger(conn: &Connection, verifying_key: &VerifyingKey) -> Result<LedgerReport> {
    let mut violations = 0u64;
    let mut sessions = BTreeSet::new();
    let entries = verify_ledger_entries_with(conn, verifying_key, |_, entry, _| {
        if matches!(entry, LedgerEntry::Violation(_)) {
            violations += 1;
        }
        sessions.insert(entry.session_id().clone());
    })?;
    verify_single_disqualification(conn)?;
    let disqualified_sessions = load_session_outcomes(conn)?
        .iter()
        .filter(|o| o.is_disqualified())
        .count() as u64;
    Ok(LedgerReport {
        entries,
        violations,
        sessions: sessions.len() as u64,
        disqualified_sessions,
        alarms: count_alarms(conn)?,
    })
}

fn blob32(row: &Row<'_>, idx: usize) -> Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    if bytes.len() != 32 {
        return Err(anyhow!("expected 32-byte blob at col {}", idx));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn blob64(row: &Row<'_>, idx: usize) -> Result<[u8; 64]> {
    let bytes: Vec<u8> = row.get(idx)?;
    if bytes.len() != 64 {
        return Err(anyhow!("expected 64-byte blob at col {}", idx));
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes);
    Ok(out)
}
