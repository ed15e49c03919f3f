//! Proctoring Integrity Engine
//!
//! This crate implements the client-resident integrity monitor for timed, high-stakes
//! exam sessions: it observes behavioural signals, classifies them into violations,
//! spends a bounded warning budget, and terminates the session when the budget runs out.
//!
//! # Architecture
//!
//! The engine enforces five invariants by construction:
//!
//! 1. **One-Way Disqualification**: once a session is disqualified it is disarmed and no
//!    further transition is accepted.
//! 2. **Armed-Only Counting**: `violation_count` only grows while the session is armed.
//! 3. **Single Terminal Record**: exactly one disqualification reaches the ledger per session.
//! 4. **Detection Is Not Punishment**: the classifier never terminates a session; only the
//!    escalation policy may.
//! 5. **Local Decision First**: ledger writes are dispatched after the decision is final and
//!    never gate it.
//!
//! # Module Structure
//!
//! - `signals`: observer interfaces for page/window/keyboard signal sources
//! - `classify`: raw signal to typed violation (pure)
//! - `policy`: warning budget and disqualification state machine
//! - `permissions`: camera/microphone capture and fullscreen elevation
//! - `ledger`: integrity ledger client and backends (in-memory, sealed SQLite, MQTT)
//! - `controller`: session wiring and arm/disarm lifecycle
//! - Core types: ViolationKind, Severity, Violation, SessionId, UserId

use anyhow::{anyhow, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

pub mod chain;
pub mod classify;
pub mod config;
pub mod controller;
pub mod ledger;
pub mod notice;
pub mod permissions;
pub mod policy;
pub mod signals;
pub mod verify;

pub use chain::{hash_entry, sign_entry, verify_entry_signature, GENESIS_HASH};
pub use classify::{Classifier, ClassifierConfig, KeyChord, RawSignal, ViewportMetrics};
pub use controller::{ControllerSettings, SessionController, SignalDisposition};
pub use ledger::{
    InMemoryLedger, IntegrityLedger, LedgerClient, LedgerCommand, LedgerFanout, LedgerStats,
    ViolationRecord,
};
pub use notice::{CollectingNotifier, LogNotifier, Notice, Notifier};
pub use permissions::{
    CaptureStream, FullscreenController, FullscreenHost, MediaConstraints, MediaDevices,
    MediaTrack, PermissionManager, SyntheticFullscreenHost, SyntheticMediaDevices, TrackKind,
    VideoSink,
};
pub use policy::{
    Capabilities, Decision, Disqualification, EscalationPolicy, IgnoreReason, IntegritySnapshot,
    PolicyConfig, PolicyPhase, SessionIntegrityState, SeverityWeights, Transition,
};
pub use signals::{SignalHub, SignalSink, SignalSource, SyntheticSignalSource};

/// Fixed warning budget used when no configuration overrides it.
pub const MAX_WARNINGS: u32 = 3;

/// Outer/inner viewport delta (px) above which devtools are assumed docked.
pub const DEVTOOLS_THRESHOLD_PX: u32 = 160;

/// Disqualification reason recorded when the warning budget is exhausted.
pub const MAX_VIOLATIONS_REASON: &str = "Maximum violations exceeded";

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:proctor_ledger_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Locks on the event path must keep working after an observer panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// -------------------- Identifier Discipline --------------------

/// Session and user identifiers travel into ledger keys and MQTT topics, so they
/// follow a positive allowlist: 1..=128 chars of `[A-Za-z0-9_.:-]`, starting alphanumeric.
pub fn validate_identifier(label: &str, value: &str) -> Result<()> {
    static IDENTIFIER_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = IDENTIFIER_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").unwrap());

    if !re.is_match(value) {
        return Err(anyhow!(
            "{} must match ^[A-Za-z0-9][A-Za-z0-9_.:-]{{0,127}}$ (got {:?})",
            label,
            value
        ));
    }
    Ok(())
}

macro_rules! identifier_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: &str) -> Result<Self> {
                let value = value.trim();
                validate_identifier($label, value)?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier_type!(
    /// Identifier of one monitored exam attempt.
    SessionId,
    "session_id"
);
identifier_type!(
    /// Identifier of the candidate taking the exam.
    UserId,
    "user_id"
);

// -------------------- Violations --------------------

/// Kind of integrity violation. Each kind carries a fixed default severity.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitch,
    WindowBlur,
    FullscreenExit,
    DevtoolsSuspected,
    MediaDenied,
    MediaTrackEnded,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 6] = [
        ViolationKind::TabSwitch,
        ViolationKind::WindowBlur,
        ViolationKind::FullscreenExit,
        ViolationKind::DevtoolsSuspected,
        ViolationKind::MediaDenied,
        ViolationKind::MediaTrackEnded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::TabSwitch => "tab_switch",
            ViolationKind::WindowBlur => "window_blur",
            ViolationKind::FullscreenExit => "fullscreen_exit",
            ViolationKind::DevtoolsSuspected => "devtools_suspected",
            ViolationKind::MediaDenied => "media_denied",
            ViolationKind::MediaTrackEnded => "media_track_ended",
        }
    }

    /// Severity used when no escalation rule or override applies.
    ///
    /// `DevtoolsSuspected` defaults to `Critical` (viewport heuristic); the blocked-shortcut
    /// path downgrades it to `Warning` in the classifier.
    pub fn default_severity(&self) -> Severity {
        match self {
            ViolationKind::TabSwitch => Severity::Warning,
            ViolationKind::WindowBlur => Severity::Warning,
            ViolationKind::FullscreenExit => Severity::Critical,
            ViolationKind::DevtoolsSuspected => Severity::Critical,
            ViolationKind::MediaDenied => Severity::Warning,
            ViolationKind::MediaTrackEnded => Severity::Warning,
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        ViolationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown violation kind '{}'", s))
    }
}

/// Ordered violation severity: `Warning < Critical < Terminal`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
    Terminal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            "terminal" => Ok(Severity::Terminal),
            other => Err(anyhow!(
                "unknown severity '{}': expected warning, critical or terminal",
                other
            )),
        }
    }
}

/// A classified behavioural signal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub description: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
        }
    }
}

// -------------------- Auditable Errors --------------------

#[derive(Clone, Debug)]
pub struct AuditableError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuditableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
impl std::error::Error for AuditableError {}

// -------------------- Device Keys --------------------

/// Derives the sealed-ledger signing key from an operator-provided seed.
pub fn signing_key_from_seed(seed: &str) -> Result<SigningKey> {
    let trimmed = seed.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("device_key_seed is required"));
    }
    let mut hasher = Sha256::new();
    hasher.update(b"proctor-device-key:");
    hasher.update(trimmed.as_bytes());
    let mut digest: [u8; 32] = hasher.finalize().into();
    let key = SigningKey::from_bytes(&digest);
    digest.zeroize();
    Ok(key)
}

pub fn verifying_key_from_seed(seed: &str) -> Result<VerifyingKey> {
    Ok(signing_key_from_seed(seed)?.verifying_key())
}

pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "invalid verifying key bytes: expected 32 bytes, got {}",
            bytes.len()
        ));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(bytes);
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| anyhow!("invalid verifying key bytes: {}", e))
}

pub fn verifying_key_from_hex(hex_str: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| anyhow!("invalid hex: {}", e))?;
    verifying_key_from_bytes(&bytes)
}

pub fn device_public_key_from_db(conn: &Connection) -> Result<VerifyingKey> {
    let bytes: Vec<u8> = conn
        .query_row(
            "SELECT public_key FROM device_metadata WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                anyhow!("device public key not found in database")
            }
            _ => anyhow!("failed to read device public key from database: {}", e),
        })?;
    verifying_key_from_bytes(&bytes)
}
