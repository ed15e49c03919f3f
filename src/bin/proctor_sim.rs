//! proctor_sim - scripted exam session against the synthetic hosts
//!
//! Drives one monitored attempt end to end: permission setup, fullscreen, arming, a
//! list of behavioural signals, then completion or disqualification. Every violation is
//! written to the sealed SQLite ledger (and optionally pushed over MQTT), so the
//! resulting database can be checked with `ledger_verify`.

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proctor_kernel::classify::{KeyChord, RawSignal, ViewportMetrics};
use proctor_kernel::config::ProctorConfig;
use proctor_kernel::ledger::mqtt::MqttLedger;
use proctor_kernel::ledger::sqlite::SqliteLedger;
use proctor_kernel::{
    CollectingNotifier, Disqualification, IntegritySnapshot, LedgerClient, LedgerFanout,
    LedgerStats, LogNotifier, Notice, Notifier, PolicyPhase, SessionController, SessionId,
    SyntheticFullscreenHost, SyntheticMediaDevices, SyntheticSignalSource, TrackKind, UserId,
};

#[path = "../ui.rs"]
mod ui;

const DEFAULT_STEPS: &str = "hidden,visible,blur,f12,context_menu,devtools";
const DEFAULT_SEED: &str = "devkey:proctor-sim";

#[derive(Parser, Debug)]
#[command(
    name = "proctor_sim",
    about = "Run a scripted proctored session and seal its violations"
)]
struct Args {
    /// Config file (TOML or JSON); falls back to $PROCTOR_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Comma-separated step names (hidden, visible, blur, fullscreen_exit, devtools, ...).
    #[arg(long, conflicts_with = "script")]
    steps: Option<String>,
    /// JSON array of steps: step names or raw signal objects.
    #[arg(long, value_name = "PATH")]
    script: Option<PathBuf>,
    /// Refuse camera and microphone access.
    #[arg(long)]
    deny_media: bool,
    /// Ledger database path (overrides config).
    #[arg(long)]
    db: Option<String>,
    /// MQTT broker for realtime push (overrides config).
    #[arg(long, value_name = "HOST:PORT")]
    mqtt: Option<String>,
    #[arg(long, default_value = "sim-session")]
    session: String,
    #[arg(long, default_value = "sim-user")]
    user: String,
    /// Delay between steps.
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Signal(RawSignal),
    LeaveFullscreen,
    EnterFullscreen,
    EndTrack(TrackKind),
    DenyMedia,
    GrantMedia,
}

impl Step {
    fn label(&self) -> String {
        match self {
            Step::Signal(signal) => signal.name().to_string(),
            Step::LeaveFullscreen => "leave_fullscreen".to_string(),
            Step::EnterFullscreen => "enter_fullscreen".to_string(),
            Step::EndTrack(track) => format!("end_{}", track),
            Step::DenyMedia => "deny_media".to_string(),
            Step::GrantMedia => "grant_media".to_string(),
        }
    }
}

fn parse_step(name: &str) -> Result<Step> {
    let signal = |s: RawSignal| -> Result<Step> { Ok(Step::Signal(s)) };
    match name.trim().to_ascii_lowercase().as_str() {
        "hidden" | "tab_switch" => signal(RawSignal::VisibilityChanged { hidden: true }),
        "visible" => signal(RawSignal::VisibilityChanged { hidden: false }),
        "blur" => signal(RawSignal::WindowBlur),
        "fullscreen_exit" | "esc" => Ok(Step::LeaveFullscreen),
        "fullscreen_enter" => Ok(Step::EnterFullscreen),
        "devtools" => signal(RawSignal::Resize {
            viewport: ViewportMetrics::new(1440, 1100, 900, 880),
        }),
        "resize" => signal(RawSignal::Resize {
            viewport: ViewportMetrics::new(1440, 1424, 900, 820),
        }),
        "f12" => signal(RawSignal::KeyDown {
            chord: KeyChord::new("F12"),
        }),
        "inspect" => signal(RawSignal::KeyDown {
            chord: KeyChord::new("c").ctrl().shift(),
        }),
        "console" => signal(RawSignal::KeyDown {
            chord: KeyChord::new("j").ctrl().shift(),
        }),
        "view_source" => signal(RawSignal::KeyDown {
            chord: KeyChord::new("u").ctrl(),
        }),
        "copy" => signal(RawSignal::KeyDown {
            chord: KeyChord::new("c").ctrl(),
        }),
        "context_menu" => signal(RawSignal::ContextMenu),
        "end_video" => Ok(Step::EndTrack(TrackKind::Video)),
        "end_audio" => Ok(Step::EndTrack(TrackKind::Audio)),
        "deny_media" => Ok(Step::DenyMedia),
        "grant_media" => Ok(Step::GrantMedia),
        other => Err(anyhow!("unknown step '{}'", other)),
    }
}

fn parse_steps(list: &str) -> Result<Vec<Step>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_step)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptStep {
    Named(String),
    Signal(RawSignal),
}

fn load_script(path: &Path) -> Result<Vec<Step>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read script {}: {}", path.display(), e))?;
    let steps: Vec<ScriptStep> = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid script {}: {}", path.display(), e))?;
    steps
        .into_iter()
        .map(|step| match step {
            ScriptStep::Named(name) => parse_step(&name),
            ScriptStep::Signal(signal) => Ok(Step::Signal(signal)),
        })
        .collect()
}

/// Logs every notice and keeps a copy for the final report.
struct SimNotifier {
    log: LogNotifier,
    collected: CollectingNotifier,
}

impl Notifier for SimNotifier {
    fn notify(&self, notice: &Notice) {
        self.log.notify(notice);
        self.collected.notify(notice);
    }
}

#[derive(Serialize)]
struct NoticeLine {
    title: &'static str,
    message: String,
}

#[derive(Serialize)]
struct SimReport {
    session_id: String,
    user_id: String,
    db: String,
    steps_run: usize,
    steps_skipped: usize,
    snapshot: IntegritySnapshot,
    integrity_score: u32,
    disqualification: Option<Disqualification>,
    notices: Vec<NoticeLine>,
    ledger: LedgerStats,
}

/// Bar over the warning budget; it fills as violations accumulate.
struct BudgetMeter {
    bar: Option<ProgressBar>,
}

impl BudgetMeter {
    fn new(ui: &ui::Ui, max_warnings: u32) -> Self {
        let bar = ui.pretty.then(|| {
            let bar = ProgressBar::new(u64::from(max_warnings));
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("violations [{bar:20}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style.progress_chars("#>-"));
            bar
        });
        Self { bar }
    }

    fn update(&self, snapshot: &IntegritySnapshot, label: &str) {
        match &self.bar {
            Some(bar) => {
                bar.set_position(u64::from(snapshot.violation_count));
                bar.set_message(format!(
                    "score {} | {}",
                    snapshot.integrity_score(),
                    label
                ));
            }
            None => eprintln!(
                "    {} -> {}/{} (score {})",
                label,
                snapshot.violation_count,
                snapshot.max_warnings,
                snapshot.integrity_score()
            ),
        }
    }

    fn finish(&self, snapshot: &IntegritySnapshot) {
        let verdict = if snapshot.is_disqualified {
            "disqualified"
        } else {
            "in good standing"
        };
        match &self.bar {
            Some(bar) => bar.finish_with_message(verdict.to_string()),
            None => eprintln!("    session {}", verdict),
        }
    }
}

struct Host {
    window: SyntheticSignalSource,
    media: SyntheticMediaDevices,
    fullscreen: SyntheticFullscreenHost,
}

impl Host {
    fn run(&self, controller: &SessionController, step: &Step) {
        match step {
            Step::Signal(signal) => {
                if let Some(disposition) = self.window.fire(signal.clone()) {
                    if disposition.suppress_default {
                        log::debug!("default action of {} suppressed", signal.name());
                    }
                }
            }
            Step::LeaveFullscreen => {
                self.fullscreen.leave();
                self.window
                    .fire(RawSignal::FullscreenChanged { active: false });
            }
            Step::EnterFullscreen => {
                controller.enter_fullscreen();
            }
            Step::EndTrack(track) => {
                if self.media.end_track(*track) == 0 {
                    log::debug!("no live {} track to end", track);
                }
            }
            Step::DenyMedia => {
                self.media.deny("Permission denied by user");
                controller.request_permissions();
            }
            Step::GrantMedia => {
                self.media.grant();
                controller.request_permissions();
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let mut cfg = match &args.config {
        Some(path) => ProctorConfig::load_from(Some(path))?,
        None => ProctorConfig::load()?,
    };
    if let Some(db) = &args.db {
        cfg.ledger_db_path = db.clone();
    }
    if let Some(broker) = &args.mqtt {
        cfg.mqtt_broker = Some(broker.clone());
    }

    let steps = match (&args.script, &args.steps) {
        (Some(path), _) => load_script(path)?,
        (None, Some(list)) => parse_steps(list)?,
        (None, None) => parse_steps(DEFAULT_STEPS)?,
    };
    let session_id = SessionId::new(&args.session)?;
    let user_id = UserId::new(&args.user)?;

    let seed = match std::env::var("PROCTOR_DEVICE_KEY_SEED") {
        Ok(seed) if !seed.trim().is_empty() => seed,
        _ => {
            log::warn!("PROCTOR_DEVICE_KEY_SEED not set; using the simulator development seed");
            DEFAULT_SEED.to_string()
        }
    };

    let ledger = {
        let _stage = ui.stage("Open ledger");
        let mut fanout =
            LedgerFanout::new().with(Box::new(SqliteLedger::open(&cfg.ledger_db_path, &seed)?));
        if let Some(settings) = cfg.mqtt_settings() {
            fanout.push(Box::new(MqttLedger::connect(&settings)?));
        }
        LedgerClient::spawn(Box::new(fanout))?
    };

    let host = Host {
        window: SyntheticSignalSource::new("window"),
        media: if args.deny_media {
            SyntheticMediaDevices::denying("Permission denied by user")
        } else {
            SyntheticMediaDevices::granting()
        },
        fullscreen: SyntheticFullscreenHost::new(),
    };
    let collected = CollectingNotifier::new();
    let controller = SessionController::new(
        cfg.controller.clone(),
        Box::new(host.media.clone()),
        Box::new(host.fullscreen.clone()),
        ledger,
        Arc::new(SimNotifier {
            log: LogNotifier,
            collected: collected.clone(),
        }),
    )
    .with_source(Box::new(host.window.clone()));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;
    }

    {
        let _stage = ui.stage("Setup: media + fullscreen");
        controller.request_permissions();
        controller.enter_fullscreen();
        let snapshot = controller.snapshot();
        if !snapshot.ready_to_start() {
            log::warn!(
                "setup incomplete (camera={}, microphone={}, fullscreen={}); starting anyway",
                snapshot.camera_granted,
                snapshot.microphone_granted,
                snapshot.is_fullscreen
            );
        }
    }

    let disqualified: Arc<Mutex<Option<Disqualification>>> = Arc::new(Mutex::new(None));
    {
        let slot = Arc::clone(&disqualified);
        controller.enable(session_id.clone(), user_id.clone(), move |outcome| {
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(outcome.clone());
            }
        })?;
    }
    if args.deny_media && cfg.controller.mandatory_media {
        // A denied setup is retried once the exam has started; that retry counts.
        controller.request_permissions();
    }

    let mut steps_run = 0usize;
    {
        let _stage = ui.stage("Run steps");
        let meter = BudgetMeter::new(&ui, cfg.controller.policy.max_warnings);
        for step in &steps {
            if stop.load(Ordering::SeqCst) {
                log::info!("interrupted; completing session");
                break;
            }
            if controller.phase() == PolicyPhase::Disqualified {
                break;
            }
            host.run(&controller, step);
            steps_run += 1;
            meter.update(&controller.snapshot(), &step.label());
            if args.interval_ms > 0 {
                std::thread::sleep(Duration::from_millis(args.interval_ms));
            }
        }
        meter.finish(&controller.snapshot());
    }

    let snapshot = controller.snapshot();
    let ledger = {
        let _stage = ui.stage("Complete session");
        controller.shutdown();
        controller.ledger_stats()
    };

    let disqualification = disqualified
        .lock()
        .map_err(|_| anyhow!("disqualification slot lock poisoned"))?
        .clone();
    let report = SimReport {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        db: cfg.ledger_db_path.clone(),
        steps_run,
        steps_skipped: steps.len() - steps_run,
        snapshot,
        integrity_score: snapshot.integrity_score(),
        disqualification,
        notices: collected
            .notices()
            .iter()
            .map(|notice| NoticeLine {
                title: notice.title(),
                message: notice.message(),
            })
            .collect(),
        ledger,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
