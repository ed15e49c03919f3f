//! ledger_verify - external verifier for the sealed proctoring ledger
//!
//! This tool proves:
//! - The ledger is hash-chained from genesis (tamper-evident)
//! - Each entry is signed by the device key (Ed25519)
//! - No session was disqualified more than once
//! - Every disqualified session outcome is backed by a sealed entry
//!
//! Verification trusts only the database contents and a device public key.

use anyhow::{anyhow, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use rusqlite::Connection;
use std::io::IsTerminal;

use proctor_kernel::ledger::sqlite::LedgerEntry;
use proctor_kernel::{device_public_key_from_db, verify, verifying_key_from_hex};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "ledger_verify",
    about = "Verify sealed proctoring ledger integrity (hash-chain + signatures)"
)]
struct Args {
    /// Path to the ledger SQLite DB
    #[arg(long, env = "PROCTOR_LEDGER_DB", default_value = "proctor_ledger.db")]
    db: String,

    /// Device public key (hex-encoded Ed25519 verifying key)
    #[arg(long, value_name = "HEX", conflicts_with = "public_key_file")]
    public_key: Option<String>,

    /// Path to file containing hex-encoded device public key
    #[arg(long, value_name = "PATH", conflicts_with = "public_key")]
    public_key_file: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn load_verifying_key(
    conn: &Connection,
    public_key_hex: Option<&str>,
    public_key_file: Option<&str>,
) -> Result<VerifyingKey> {
    if let Some(hex) = public_key_hex {
        return verifying_key_from_hex(hex);
    }
    if let Some(path) = public_key_file {
        let key_hex = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read public key file {}: {}", path, e))?;
        return verifying_key_from_hex(key_hex.trim());
    }
    device_public_key_from_db(conn).map_err(|e| {
        anyhow!(
            "{} (provide --public-key or --public-key-file if the database has no key)",
            e
        )
    })
}

fn describe(entry: &LedgerEntry) -> String {
    match entry {
        LedgerEntry::Violation(record) => format!(
            "violation {} ({}, weight {})",
            record.kind, record.severity, record.weight
        ),
        LedgerEntry::ViolationCount { count, .. } => format!("violation_count={}", count),
        LedgerEntry::Disqualified { reason, .. } => format!("disqualified: {}", reason),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );
    let conn = {
        let _stage = ui.stage("Open database");
        Connection::open(&args.db)?
    };
    let verifying_key = {
        let _stage = ui.stage("Load verifying key");
        load_verifying_key(
            &conn,
            args.public_key.as_deref(),
            args.public_key_file.as_deref(),
        )?
    };

    println!("ledger_verify: checking {}", args.db);
    println!();

    let alarm_count = verify::count_alarms(&conn)?;
    if alarm_count > 0 {
        println!("WARNING: {} conformance alarms recorded", alarm_count);
        if args.verbose {
            for alarm in verify::load_alarms(&conn)? {
                println!(
                    "  ALARM @{}: {} - {}",
                    alarm.created_at, alarm.code, alarm.message
                );
            }
        }
    }

    {
        let _stage = ui.stage("Verify ledger entries");
        println!("=== Ledger Entries ===");
        let count =
            verify::verify_ledger_entries_with(&conn, &verifying_key, |id, entry, entry_hash| {
                if args.verbose {
                    println!(
                        "  entry {} [{}]: {} hash={} OK",
                        id,
                        entry.session_id(),
                        describe(entry),
                        &hex::encode(entry_hash)[..16]
                    );
                }
            })?;
        println!("verified {} ledger entries", count);
    }
    println!();

    let report = {
        let _stage = ui.stage("Verify session outcomes");
        println!("=== Session Outcomes ===");
        let report = verify::verify_ledger(&conn, &verifying_key)?;
        if args.verbose {
            for outcome in verify::load_session_outcomes(&conn)? {
                println!(
                    "  session {}: violations={} proctoring_status={} status={}",
                    outcome.session_id,
                    outcome.violation_count,
                    outcome.proctoring_status,
                    outcome.status
                );
            }
        }
        println!(
            "{} sessions, {} violations, {} disqualified",
            report.sessions, report.violations, report.disqualified_sessions
        );
        report
    };

    if report.alarms > 0 {
        println!("OK: chain verified ({} alarms need review).", report.alarms);
    } else {
        println!("OK: chain verified.");
    }
    Ok(())
}
