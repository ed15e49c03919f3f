//! Session-level escalation scenarios.
//!
//! Drives the controller through synthetic signal sources, capture devices and a
//! fullscreen host, and checks counting, disqualification and teardown as seen from
//! the outside: snapshots, ledger writes, notices and the disqualify callback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use proctor_kernel::{
    ClassifierConfig, CollectingNotifier, ControllerSettings, Decision, Disqualification,
    IgnoreReason, InMemoryLedger, IntegrityLedger, LedgerClient, LedgerCommand, Notice,
    PolicyConfig, PolicyPhase, RawSignal, SessionController, SessionId, Severity,
    SyntheticFullscreenHost, SyntheticMediaDevices, SyntheticSignalSource, UserId,
    ViewportMetrics, ViolationKind, ViolationRecord, MAX_VIOLATIONS_REASON,
};

struct Exam {
    controller: SessionController,
    page: SyntheticSignalSource,
    ledger: InMemoryLedger,
    notices: CollectingNotifier,
    media: SyntheticMediaDevices,
    host: SyntheticFullscreenHost,
    fired: Arc<AtomicU32>,
    outcome: Arc<Mutex<Option<Disqualification>>>,
}

fn exam_with(settings: ControllerSettings) -> Exam {
    exam_on(settings, SyntheticFullscreenHost::new())
}

fn exam_on(settings: ControllerSettings, host: SyntheticFullscreenHost) -> Exam {
    let page = SyntheticSignalSource::new("page");
    let ledger = InMemoryLedger::new();
    let notices = CollectingNotifier::new();
    let media = SyntheticMediaDevices::granting();
    let controller = SessionController::new(
        settings,
        Box::new(media.clone()),
        Box::new(host.clone()),
        LedgerClient::inline(Box::new(ledger.clone())),
        Arc::new(notices.clone()),
    )
    .with_source(Box::new(page.clone()));
    Exam {
        controller,
        page,
        ledger,
        notices,
        media,
        host,
        fired: Arc::new(AtomicU32::new(0)),
        outcome: Arc::new(Mutex::new(None)),
    }
}

fn exam() -> Exam {
    exam_with(ControllerSettings::default())
}

fn session() -> SessionId {
    SessionId::new("exam-2024-final").expect("session id")
}

fn start(exam: &Exam) {
    let fired = Arc::clone(&exam.fired);
    let outcome = Arc::clone(&exam.outcome);
    exam.controller
        .enable(
            session(),
            UserId::new("student-17").expect("user id"),
            move |d| {
                fired.fetch_add(1, Ordering::SeqCst);
                *outcome.lock().unwrap() = Some(d.clone());
            },
        )
        .expect("enable");
}

fn hidden() -> RawSignal {
    RawSignal::VisibilityChanged { hidden: true }
}

fn devtools_resize() -> RawSignal {
    RawSignal::Resize {
        viewport: ViewportMetrics::new(1600, 1200, 900, 900),
    }
}

#[test]
fn warnings_below_budget_keep_session_armed() {
    let exam = exam();
    start(&exam);

    for signal in [hidden(), RawSignal::WindowBlur] {
        let decision = exam.page.fire(signal).unwrap().decision.unwrap();
        assert!(matches!(decision, Decision::Warned { .. }));
        let snap = exam.controller.snapshot();
        assert!(snap.armed);
        assert!(!snap.is_disqualified);
    }
    assert_eq!(exam.controller.snapshot().violation_count, 2);
    assert_eq!(exam.controller.phase(), PolicyPhase::ArmedWarned(2));
    assert_eq!(exam.fired.load(Ordering::SeqCst), 0);
    assert!(exam.controller.is_listening());
}

#[test]
fn three_hidden_pages_disqualify_on_the_third() {
    let exam = exam();
    start(&exam);

    let counts: Vec<Option<u32>> = (0..3)
        .map(|_| {
            exam.page
                .fire(hidden())
                .and_then(|d| d.decision)
                .and_then(|d| d.violation_count())
        })
        .collect();
    assert_eq!(counts, vec![Some(1), Some(2), Some(3)]);

    assert_eq!(exam.fired.load(Ordering::SeqCst), 1);
    let outcome = exam.outcome.lock().unwrap().clone().unwrap();
    assert_eq!(outcome.reason, MAX_VIOLATIONS_REASON);
    assert_eq!(outcome.violation_count, 3);
    assert_eq!(outcome.session_id, session());

    assert_eq!(
        exam.ledger.disqualification(&session()).map(|(r, _)| r),
        Some(MAX_VIOLATIONS_REASON.to_string())
    );
    assert_eq!(exam.ledger.violation_count(&session()), Some(3));

    // Warnings for the first two, termination only for the breach.
    let notices = exam.notices.notices();
    assert_eq!(notices.len(), 3);
    assert_eq!(notices[0].message(), "Tab switched or minimized (1/3 warnings)");
    assert_eq!(
        notices[2],
        Notice::Terminated {
            reason: MAX_VIOLATIONS_REASON.to_string()
        }
    );
}

#[test]
fn two_criticals_disqualify_after_the_second() {
    let exam = exam();
    start(&exam);

    let first = exam.page.fire(devtools_resize()).unwrap().decision.unwrap();
    assert!(matches!(
        first,
        Decision::Warned {
            weight: 2,
            violation_count: 2,
            ..
        }
    ));
    assert!(!exam.controller.snapshot().is_disqualified);

    let second = exam.page.fire(devtools_resize()).unwrap().decision.unwrap();
    assert!(second.is_disqualification());
    assert_eq!(exam.controller.snapshot().violation_count, 4);
    assert_eq!(exam.fired.load(Ordering::SeqCst), 1);
}

#[test]
fn terminal_violation_fires_callback_once_under_flooding() {
    let mut overrides = BTreeMap::new();
    overrides.insert(ViolationKind::TabSwitch, Severity::Terminal);
    let exam = exam_with(ControllerSettings {
        classifier: ClassifierConfig {
            severity_overrides: overrides,
            ..ClassifierConfig::default()
        },
        ..ControllerSettings::default()
    });
    start(&exam);

    let decision = exam.page.fire(hidden()).unwrap().decision.unwrap();
    assert!(decision.is_disqualification());
    assert_eq!(exam.controller.snapshot().violation_count, 0);
    assert_eq!(
        exam.outcome.lock().unwrap().as_ref().map(|d| d.reason.clone()),
        Some("Tab switched or minimized".to_string())
    );

    // Listeners are gone; direct injection is ignored.
    assert!(!exam.controller.is_listening());
    assert!(exam.page.fire(hidden()).is_none());
    for _ in 0..50 {
        let disposition = exam.controller.handle_signal(hidden());
        assert_eq!(
            disposition.decision,
            Some(Decision::Ignored(IgnoreReason::AlreadyDisqualified))
        );
    }

    assert_eq!(exam.fired.load(Ordering::SeqCst), 1);
    assert_eq!(exam.ledger.mark_attempts(), 1);
    assert_eq!(exam.notices.terminations(), 1);
    // The terminal violation itself is kept as evidence.
    let violations = exam.ledger.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Terminal);
    assert_eq!(violations[0].weight, 0);
}

#[test]
fn disabled_session_ignores_late_signals() {
    let exam = exam();
    start(&exam);
    assert!(exam.controller.disable());

    assert!(exam.page.fire(hidden()).is_none());
    let late = exam.controller.handle_signal(hidden());
    assert_eq!(
        late.decision,
        Some(Decision::Ignored(IgnoreReason::NotArmed))
    );
    exam.controller.handle_signal(RawSignal::WindowBlur);
    exam.controller
        .handle_signal(RawSignal::FullscreenChanged { active: false });

    assert_eq!(exam.controller.snapshot().violation_count, 0);
    assert_eq!(exam.ledger.calls(), 0);
    assert_eq!(exam.fired.load(Ordering::SeqCst), 0);
    assert!(!exam.controller.disable());
}

#[test]
fn denied_permissions_do_not_disqualify() {
    let exam = exam();
    exam.media.deny("Permission denied");
    start(&exam);

    assert!(!exam.controller.request_permissions());
    let snap = exam.controller.snapshot();
    assert!(!snap.camera_granted);
    assert!(!snap.microphone_granted);
    assert!(!snap.is_disqualified);
    assert!(!snap.ready_to_start());
    assert!(exam.notices.notices().contains(&Notice::PermissionsRequired));
}

#[test]
fn unexpected_fullscreen_loss_is_one_critical() {
    let exam = exam();
    assert!(exam.controller.request_permissions());
    assert!(exam.controller.enter_fullscreen());
    start(&exam);

    exam.host.leave();
    exam.page.fire(RawSignal::FullscreenChanged { active: false });

    let violations = exam.ledger.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::FullscreenExit);
    assert_eq!(violations[0].severity, Severity::Critical);
    assert_eq!(violations[0].weight, 2);
    let snap = exam.controller.snapshot();
    assert_eq!(snap.violation_count, 2);
    assert!(!snap.is_fullscreen);
}

#[test]
fn repeated_fullscreen_loss_counts_once() {
    let exam = exam();
    assert!(exam.controller.enter_fullscreen());
    start(&exam);

    exam.host.leave();
    let first = exam
        .page
        .fire(RawSignal::FullscreenChanged { active: false })
        .unwrap();
    assert_eq!(first.decision.and_then(|d| d.violation_count()), Some(2));

    // A second change event (or re-check) for the same exit is not a new loss.
    let again = exam
        .page
        .fire(RawSignal::FullscreenChanged { active: false })
        .unwrap();
    assert_eq!(again.decision, None);

    let snap = exam.controller.snapshot();
    assert_eq!(snap.violation_count, 2);
    assert!(!snap.is_disqualified);
    assert_eq!(exam.ledger.violations().len(), 1);

    // Re-entering makes the next exit count again.
    assert!(exam.controller.enter_fullscreen());
    exam.host.leave();
    exam.page.fire(RawSignal::FullscreenChanged { active: false });
    assert!(exam.controller.snapshot().is_disqualified);
}

#[test]
fn fullscreen_loss_without_fullscreen_is_not_counted() {
    let exam = exam_on(
        ControllerSettings::default(),
        SyntheticFullscreenHost::unsupported(),
    );
    assert!(!exam.controller.enter_fullscreen());
    start(&exam);

    let disposition = exam
        .page
        .fire(RawSignal::FullscreenChanged { active: false })
        .unwrap();
    assert_eq!(disposition.decision, None);
    assert_eq!(exam.controller.snapshot().violation_count, 0);
    assert_eq!(exam.ledger.calls(), 0);
}

/// Keeps every command in arrival order.
#[derive(Clone, Default)]
struct RecordingLedger {
    commands: Arc<Mutex<Vec<LedgerCommand>>>,
}

impl RecordingLedger {
    fn commands(&self) -> Vec<LedgerCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl IntegrityLedger for RecordingLedger {
    fn append_violation(&mut self, record: &ViolationRecord) -> anyhow::Result<()> {
        self.apply(&LedgerCommand::AppendViolation(record.clone()))
    }

    fn update_session_violation_count(
        &mut self,
        session_id: &SessionId,
        count: u32,
    ) -> anyhow::Result<()> {
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
    ) -> anyhow::Result<()> {
        self.apply(&LedgerCommand::MarkDisqualified {
            session_id: session_id.clone(),
            reason: reason.to_string(),
            completed_at,
        })
    }

    fn apply(&mut self, command: &LedgerCommand) -> anyhow::Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(())
    }
}

#[test]
fn concurrent_signals_reach_the_ledger_in_decision_order() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 40;

    let recorded = RecordingLedger::default();
    let controller = SessionController::new(
        ControllerSettings {
            policy: PolicyConfig {
                max_warnings: THREADS * PER_THREAD + 1,
                ..PolicyConfig::default()
            },
            ..ControllerSettings::default()
        },
        Box::new(SyntheticMediaDevices::granting()),
        Box::new(SyntheticFullscreenHost::new()),
        LedgerClient::spawn(Box::new(recorded.clone())).expect("spawn ledger"),
        Arc::new(CollectingNotifier::new()),
    );
    controller
        .enable(session(), UserId::new("student-17").unwrap(), |_| {})
        .expect("enable");

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..PER_THREAD {
                    controller.handle_signal(RawSignal::WindowBlur);
                }
            });
        }
    });
    controller.shutdown();

    let commands = recorded.commands();
    assert_eq!(commands.len(), (2 * THREADS * PER_THREAD) as usize);
    for (i, pair) in commands.chunks(2).enumerate() {
        assert!(matches!(pair[0], LedgerCommand::AppendViolation(_)));
        match &pair[1] {
            LedgerCommand::UpdateViolationCount { count, .. } => {
                assert_eq!(*count, i as u32 + 1)
            }
            other => panic!("expected a count update, got {:?}", other),
        }
    }
}

#[test]
fn ledger_outage_does_not_block_disqualification() {
    let exam = exam();
    exam.ledger.set_failing(Some("store offline"));
    start(&exam);

    for _ in 0..3 {
        exam.page.fire(RawSignal::WindowBlur);
    }
    assert!(exam.controller.snapshot().is_disqualified);
    assert_eq!(exam.fired.load(Ordering::SeqCst), 1);
    assert!(exam.ledger.violations().is_empty());
    assert!(exam.controller.ledger_stats().failed > 0);
}

#[test]
fn disqualification_releases_media_and_fullscreen() {
    let exam = exam();
    assert!(exam.controller.request_permissions());
    assert!(exam.controller.enter_fullscreen());
    start(&exam);
    assert_eq!(exam.media.live_tracks(), 2);

    for _ in 0..3 {
        exam.page.fire(hidden());
    }
    assert_eq!(exam.media.live_tracks(), 0);
    let snap = exam.controller.snapshot();
    assert!(!snap.is_fullscreen);
    assert!(!snap.camera_granted);
    assert!(snap.is_disqualified);
}

#[test]
fn new_session_starts_clean_after_completion() {
    let exam = exam();
    start(&exam);
    exam.page.fire(hidden());
    assert!(exam.controller.disable());

    exam.controller
        .enable(
            SessionId::new("exam-2024-retake").unwrap(),
            UserId::new("student-17").unwrap(),
            |_| {},
        )
        .unwrap();
    assert_eq!(exam.controller.snapshot().violation_count, 0);
    assert_eq!(exam.page.subscription_count(), 2);

    exam.page.fire(hidden());
    assert_eq!(exam.controller.snapshot().violation_count, 1);
}
