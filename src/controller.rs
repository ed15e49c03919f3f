//! Session controller.
//!
//! Wires signal sources through the classifier into the escalation policy, then hands
//! the resulting ledger commands, notices and the disqualify callback to their
//! collaborators. One controller owns one `SessionIntegrityState` at a time.
//!
//! Locking: the policy lock is held for the read-classify-decide step and for handing the
//! resulting ledger commands to the client, so commands from concurrent signals reach the
//! ledger in decision order. With a spawned client that hand-off is a channel send; the
//! write itself happens on the worker. Notices, teardown and the callback run after the
//! lock is released. The policy lock is never acquired while the source, media or
//! fullscreen lock is held by the same call path.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::classify::{Classifier, ClassifierConfig, RawSignal};
use crate::ledger::{LedgerClient, LedgerStats};
use crate::notice::{Notice, Notifier};
use crate::permissions::{
    FullscreenController, FullscreenHost, MediaDevices, PermissionManager, TrackEndedObserver,
    VideoSink,
};
use crate::policy::{
    Decision, Disqualification, EscalationPolicy, IgnoreReason, IntegritySnapshot, PolicyConfig,
    PolicyPhase, SessionIntegrityState, Transition,
};
use crate::signals::{SignalHub, SignalSink, SignalSource};
use crate::{lock_or_recover, now_s, SessionId, UserId};

/// What a signal source should do with the native action, and what the policy decided.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalDisposition {
    /// Cancel the native default (context menu, devtools shortcut).
    pub suppress_default: bool,
    /// `None` when the signal was not a violation.
    pub decision: Option<Decision>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    pub policy: PolicyConfig,
    pub classifier: ClassifierConfig,
    /// A capture denial while armed counts as a `media_denied` violation.
    pub mandatory_media: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            classifier: ClassifierConfig::default(),
            mandatory_media: true,
        }
    }
}

pub type DisqualifyCallback = Box<dyn FnOnce(&Disqualification) + Send>;

struct Core {
    policy: EscalationPolicy,
    on_disqualify: Option<DisqualifyCallback>,
    media_denials: u32,
    /// Bumped on every arm/disarm; sinks from older cycles are ignored.
    epoch: u64,
}

struct Shared {
    core: Mutex<Core>,
    classifier: Classifier,
    ledger: LedgerClient,
    notifier: Arc<dyn Notifier>,
    sources: Mutex<SignalHub>,
    media: Mutex<PermissionManager>,
    fullscreen: Mutex<FullscreenController>,
    expected_exit: Arc<AtomicBool>,
    mandatory_media: bool,
}

impl Shared {
    fn route(&self, signal: RawSignal, epoch: Option<u64>) -> SignalDisposition {
        let now = now_s().unwrap_or_else(|e| {
            log::warn!("system clock unavailable: {}", e);
            0
        });

        let (transition, callback, suppress_default) = {
            let mut core = lock_or_recover(&self.core);
            if let Some(epoch) = epoch {
                if epoch != core.epoch {
                    log::debug!("dropped {} from a previous arm cycle", signal.name());
                    return SignalDisposition::default();
                }
            }

            let mut expected_loss = false;
            let mut redundant_loss = false;
            match &signal {
                RawSignal::FullscreenChanged { active } => {
                    let was_fullscreen = core.policy.set_fullscreen(*active);
                    expected_loss = self.expected_exit.swap(false, Ordering::SeqCst) && !*active;
                    redundant_loss = !*active && !was_fullscreen;
                }
                RawSignal::MediaTrackEnded { track } => core.policy.revoke_track(*track),
                _ => {}
            }

            if !core.policy.is_armed() {
                let reason = match core.policy.phase() {
                    PolicyPhase::Disqualified => IgnoreReason::AlreadyDisqualified,
                    _ => IgnoreReason::NotArmed,
                };
                log::debug!("ignored {} ({:?})", signal.name(), reason);
                return SignalDisposition {
                    suppress_default: false,
                    decision: Some(Decision::Ignored(reason)),
                };
            }

            let suppress_default = self.classifier.suppresses_default(&signal);
            if expected_loss || redundant_loss {
                if expected_loss {
                    log::debug!("fullscreen exit initiated by controller");
                } else {
                    log::debug!("fullscreen-lost while not fullscreen; not counted");
                }
                return SignalDisposition {
                    suppress_default,
                    decision: None,
                };
            }
            let Some(violation) = self.classifier.classify(&signal) else {
                return SignalDisposition {
                    suppress_default,
                    decision: None,
                };
            };

            let mut transition = core.policy.apply(violation, now);
            // Enqueue under the lock so commands reach the ledger in decision order.
            self.ledger.dispatch_all(std::mem::take(&mut transition.ledger));
            let callback = if transition.decision.is_disqualification() {
                core.on_disqualify.take()
            } else {
                None
            };
            (transition, callback, suppress_default)
        };

        self.finish(transition, callback, suppress_default)
    }

    fn finish(
        &self,
        transition: Transition,
        callback: Option<DisqualifyCallback>,
        suppress_default: bool,
    ) -> SignalDisposition {
        let Transition { decision, notice, .. } = transition;

        match &decision {
            Decision::Warned {
                violation,
                violation_count,
                max_warnings,
                ..
            } => log::warn!(
                "{} violation: {} ({}/{})",
                violation.severity,
                violation.kind,
                violation_count,
                max_warnings
            ),
            Decision::Disqualified {
                violation,
                disqualification,
            } => log::info!(
                "session {} disqualified after {}: {}",
                disqualification.session_id,
                violation.kind,
                disqualification.reason
            ),
            Decision::Ignored(reason) => log::debug!("violation ignored ({:?})", reason),
        }

        if let Some(notice) = &notice {
            self.notifier.notify(notice);
        }

        if let Decision::Disqualified {
            disqualification, ..
        } = &decision
        {
            self.teardown();
            match callback {
                Some(callback) => callback(disqualification),
                None => log::warn!(
                    "session {} disqualified with no callback registered",
                    disqualification.session_id
                ),
            }
        }

        SignalDisposition {
            suppress_default,
            decision: Some(decision),
        }
    }

    /// Deregisters sources, stops capture and leaves fullscreen. Idempotent.
    fn teardown(&self) {
        lock_or_recover(&self.sources).deregister_all();
        lock_or_recover(&self.media).release();
        lock_or_recover(&self.fullscreen).exit();
        let mut core = lock_or_recover(&self.core);
        core.policy.set_media_grants(false, false);
        core.policy.set_fullscreen(false);
    }
}

/// Orchestrates one monitored exam attempt at a time.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        settings: ControllerSettings,
        media: Box<dyn MediaDevices>,
        fullscreen: Box<dyn FullscreenHost>,
        ledger: LedgerClient,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let fullscreen = FullscreenController::new(fullscreen);
        let expected_exit = fullscreen.expected_exit_marker();
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    policy: EscalationPolicy::new(settings.policy),
                    on_disqualify: None,
                    media_denials: 0,
                    epoch: 0,
                }),
                classifier: Classifier::new(settings.classifier),
                ledger,
                notifier,
                sources: Mutex::new(SignalHub::new()),
                media: Mutex::new(PermissionManager::new(media)),
                fullscreen: Mutex::new(fullscreen),
                expected_exit,
                mandatory_media: settings.mandatory_media,
            }),
        }
    }

    pub fn with_source(self, source: Box<dyn SignalSource>) -> Self {
        self.add_source(source);
        self
    }

    /// Sources added while armed start receiving on the next `enable`.
    pub fn add_source(&self, source: Box<dyn SignalSource>) {
        lock_or_recover(&self.shared.sources).add(source);
    }

    /// Arms monitoring for `session_id`. Re-enabling the armed session is a no-op.
    pub fn enable<F>(&self, session_id: SessionId, user_id: UserId, on_disqualify: F) -> Result<()>
    where
        F: FnOnce(&Disqualification) + Send + 'static,
    {
        let epoch = {
            let mut core = lock_or_recover(&self.shared.core);
            if let Some(state) = core.policy.state() {
                if state.is_armed() && state.session_id() == &session_id {
                    log::debug!("session {} already armed", session_id);
                    return Ok(());
                }
            }
            core.policy.arm(session_id.clone(), user_id.clone())?;
            core.on_disqualify = Some(Box::new(on_disqualify));
            core.media_denials = 0;
            core.epoch += 1;
            core.epoch
        };

        let sink = self.sink(epoch);
        let registered = lock_or_recover(&self.shared.sources).register_all(&sink);
        if let Err(e) = registered {
            let mut core = lock_or_recover(&self.shared.core);
            if core.epoch == epoch {
                core.policy.disarm();
                core.on_disqualify = None;
                core.epoch += 1;
            }
            return Err(e);
        }

        log::info!(
            "proctoring armed for session {} (user {})",
            session_id,
            user_id
        );
        Ok(())
    }

    /// Normal completion. Returns whether a session was armed. Signals delivered after
    /// this starts are no-ops.
    pub fn disable(&self) -> bool {
        let disarmed = {
            let mut core = lock_or_recover(&self.shared.core);
            let disarmed = core.policy.disarm();
            core.on_disqualify = None;
            core.epoch += 1;
            if disarmed {
                if let Some(state) = core.policy.state() {
                    log::info!("proctoring disarmed for session {}", state.session_id());
                }
            }
            disarmed
        };
        self.shared.teardown();
        disarmed
    }

    /// Disables and drains the ledger client.
    pub fn shutdown(&self) {
        self.disable();
        self.shared.ledger.shutdown();
    }

    /// Combined camera + microphone request. A denial raises the permissions notice and,
    /// with mandatory media while armed, a `media_denied` violation.
    pub fn request_permissions(&self) -> bool {
        let observer = self.track_observer();
        let (granted, camera, microphone) = {
            let mut media = lock_or_recover(&self.shared.media);
            let granted = media.request_permissions(observer);
            (granted, media.camera_granted(), media.microphone_granted())
        };

        let denial_attempt = {
            let mut core = lock_or_recover(&self.shared.core);
            core.policy.set_media_grants(camera, microphone);
            if !granted && self.shared.mandatory_media && core.policy.is_armed() {
                core.media_denials += 1;
                Some(core.media_denials)
            } else {
                None
            }
        };

        if !granted {
            self.shared.notifier.notify(&Notice::PermissionsRequired);
            if let Some(attempt) = denial_attempt {
                self.shared
                    .route(RawSignal::MediaDenied { attempt }, None);
            }
        }
        granted
    }

    pub fn enter_fullscreen(&self) -> bool {
        let (entered, active) = {
            let mut fullscreen = lock_or_recover(&self.shared.fullscreen);
            let entered = fullscreen.enter();
            (entered, fullscreen.is_fullscreen())
        };
        lock_or_recover(&self.shared.core)
            .policy
            .set_fullscreen(active);
        entered
    }

    /// Controller-initiated exit; the resulting fullscreen-lost signal is not counted.
    pub fn exit_fullscreen(&self) {
        lock_or_recover(&self.shared.fullscreen).exit();
        lock_or_recover(&self.shared.core)
            .policy
            .set_fullscreen(false);
    }

    pub fn attach_video_sink(&self, sink: &mut dyn VideoSink) -> bool {
        lock_or_recover(&self.shared.media).attach_video_sink(sink)
    }

    /// Direct injection path for hosts that deliver events without a `SignalSource`.
    pub fn handle_signal(&self, signal: RawSignal) -> SignalDisposition {
        self.shared.route(signal, None)
    }

    pub fn snapshot(&self) -> IntegritySnapshot {
        lock_or_recover(&self.shared.core).policy.snapshot()
    }

    pub fn phase(&self) -> PolicyPhase {
        lock_or_recover(&self.shared.core).policy.phase()
    }

    pub fn state(&self) -> Option<SessionIntegrityState> {
        lock_or_recover(&self.shared.core).policy.state().cloned()
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.shared.ledger.stats()
    }

    pub fn is_listening(&self) -> bool {
        lock_or_recover(&self.shared.sources).is_registered()
    }

    fn sink(&self, epoch: u64) -> SignalSink {
        let weak = Arc::downgrade(&self.shared);
        SignalSink::new(move |signal| match weak.upgrade() {
            Some(shared) => shared.route(signal, Some(epoch)),
            None => SignalDisposition::default(),
        })
    }

    fn track_observer(&self) -> TrackEndedObserver {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move |track| {
            if let Some(shared) = weak.upgrade() {
                shared.route(RawSignal::MediaTrackEnded { track }, None);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::notice::CollectingNotifier;
    use crate::permissions::{SyntheticFullscreenHost, SyntheticMediaDevices, TrackKind};
    use crate::signals::SyntheticSignalSource;
    use crate::KeyChord;

    struct Harness {
        controller: SessionController,
        source: SyntheticSignalSource,
        ledger: InMemoryLedger,
        notices: CollectingNotifier,
        media: SyntheticMediaDevices,
        host: SyntheticFullscreenHost,
    }

    fn harness(settings: ControllerSettings) -> Harness {
        let source = SyntheticSignalSource::new("page");
        let ledger = InMemoryLedger::new();
        let notices = CollectingNotifier::new();
        let media = SyntheticMediaDevices::granting();
        let host = SyntheticFullscreenHost::new();
        let controller = SessionController::new(
            settings,
            Box::new(media.clone()),
            Box::new(host.clone()),
            LedgerClient::inline(Box::new(ledger.clone())),
            Arc::new(notices.clone()),
        )
        .with_source(Box::new(source.clone()));
        Harness {
            controller,
            source,
            ledger,
            notices,
            media,
            host,
        }
    }

    fn enable(h: &Harness) {
        h.controller
            .enable(
                SessionId::new("test-1").unwrap(),
                UserId::new("user-1").unwrap(),
                |_| {},
            )
            .unwrap();
    }

    #[test]
    fn context_menu_is_suppressed_only_while_armed() {
        let h = harness(ControllerSettings::default());
        let before = h.controller.handle_signal(RawSignal::ContextMenu);
        assert!(!before.suppress_default);

        enable(&h);
        let armed = h.source.fire(RawSignal::ContextMenu).unwrap();
        assert!(armed.suppress_default);
        assert!(armed.decision.is_none());

        let key = h
            .source
            .fire(RawSignal::KeyDown {
                chord: KeyChord::new("F12"),
            })
            .unwrap();
        assert!(key.suppress_default);
        assert_eq!(key.decision.and_then(|d| d.violation_count()), Some(1));
    }

    #[test]
    fn enable_is_idempotent_for_the_same_session() {
        let h = harness(ControllerSettings::default());
        enable(&h);
        enable(&h);
        assert_eq!(h.source.subscription_count(), 1);
        assert!(h
            .controller
            .enable(
                SessionId::new("test-2").unwrap(),
                UserId::new("user-1").unwrap(),
                |_| {}
            )
            .is_err());
    }

    #[test]
    fn mandatory_media_denial_counts_while_armed() {
        let h = harness(ControllerSettings::default());
        h.media.deny("blocked by OS");
        assert!(!h.controller.request_permissions());
        assert_eq!(h.controller.snapshot().violation_count, 0);
        assert_eq!(h.notices.notices(), vec![Notice::PermissionsRequired]);

        enable(&h);
        assert!(!h.controller.request_permissions());
        let snap = h.controller.snapshot();
        assert_eq!(snap.violation_count, 1);
        assert!(!snap.camera_granted && !snap.microphone_granted);
        assert_eq!(h.ledger.violations()[0].kind, crate::ViolationKind::MediaDenied);
    }

    #[test]
    fn optional_media_denial_only_notifies() {
        let h = harness(ControllerSettings {
            mandatory_media: false,
            ..ControllerSettings::default()
        });
        enable(&h);
        h.media.deny("no camera");
        assert!(!h.controller.request_permissions());
        assert_eq!(h.controller.snapshot().violation_count, 0);
        assert_eq!(h.notices.count(), 1);
    }

    #[test]
    fn track_end_revokes_matching_capability() {
        let h = harness(ControllerSettings::default());
        assert!(h.controller.request_permissions());
        assert!(h.controller.enter_fullscreen());
        assert!(h.controller.snapshot().ready_to_start());
        enable(&h);

        h.media.end_track(TrackKind::Audio);
        let snap = h.controller.snapshot();
        assert!(snap.camera_granted);
        assert!(!snap.microphone_granted);
        assert_eq!(snap.violation_count, 1);
        assert_eq!(
            h.ledger.violations()[0].description,
            "audio track ended unexpectedly"
        );
    }

    #[test]
    fn controller_exit_is_not_a_violation() {
        let h = harness(ControllerSettings::default());
        assert!(h.controller.enter_fullscreen());
        enable(&h);

        h.controller.exit_fullscreen();
        h.source.fire(RawSignal::FullscreenChanged { active: false });
        assert_eq!(h.controller.snapshot().violation_count, 0);

        assert!(h.controller.enter_fullscreen());
        h.host.leave();
        h.source.fire(RawSignal::FullscreenChanged { active: false });
        assert_eq!(h.controller.snapshot().violation_count, 2);
    }

    #[test]
    fn failed_source_registration_leaves_controller_disarmed() {
        let h = harness(ControllerSettings::default());
        h.source.set_fail_subscribe(true);
        assert!(h
            .controller
            .enable(
                SessionId::new("test-1").unwrap(),
                UserId::new("user-1").unwrap(),
                |_| {}
            )
            .is_err());
        assert_eq!(h.controller.phase(), PolicyPhase::Disarmed);
        assert!(!h.controller.is_listening());

        h.source.set_fail_subscribe(false);
        enable(&h);
        assert_eq!(h.controller.phase(), PolicyPhase::ArmedClean);
    }
}
