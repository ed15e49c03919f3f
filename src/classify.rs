//! Violation classifier.
//!
//! Maps raw signals from the signal sources onto typed violations. Classification is a
//! pure function of the classifier configuration and the signal: it reads no session
//! state and has no authority to terminate a session.
//!
//! | Signal                              | Kind                 | Default severity |
//! |-------------------------------------|----------------------|------------------|
//! | page hidden                         | `tab_switch`         | warning          |
//! | window blur                         | `window_blur`        | warning          |
//! | fullscreen unexpectedly lost        | `fullscreen_exit`    | critical         |
//! | viewport delta above threshold      | `devtools_suspected` | critical         |
//! | capture request rejected            | `media_denied`       | warning          |
//! | capture track ended                 | `media_track_ended`  | warning          |
//! | blocked devtools shortcut           | `devtools_suspected` | warning          |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::permissions::TrackKind;
use crate::{Severity, Violation, ViolationKind, DEVTOOLS_THRESHOLD_PX};

const TAB_SWITCH_DESCRIPTION: &str = "Tab switched or minimized";
const WINDOW_BLUR_DESCRIPTION: &str = "Window lost focus";
const FULLSCREEN_EXIT_DESCRIPTION: &str = "Exited fullscreen mode";
const DEVTOOLS_VIEWPORT_DESCRIPTION: &str = "Developer tools detected";
const DEVTOOLS_SHORTCUT_DESCRIPTION: &str = "Attempted to open developer tools";
const MEDIA_DENIED_DESCRIPTION: &str = "Camera or microphone access denied";

/// Window geometry reported by a resize observer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewportMetrics {
    pub outer_width: u32,
    pub inner_width: u32,
    pub outer_height: u32,
    pub inner_height: u32,
}

impl ViewportMetrics {
    pub fn new(outer_width: u32, inner_width: u32, outer_height: u32, inner_height: u32) -> Self {
        Self {
            outer_width,
            inner_width,
            outer_height,
            inner_height,
        }
    }

    /// Largest outer/inner delta across both axes.
    pub fn max_delta(&self) -> u32 {
        let dw = self.outer_width.saturating_sub(self.inner_width);
        let dh = self.outer_height.saturating_sub(self.inner_height);
        dw.max(dh)
    }
}

/// A key press with its modifier state.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyChord {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

impl KeyChord {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// F12, Ctrl+Shift+I/J/C and Ctrl+U. Letters match case-insensitively.
    pub fn is_blocked_shortcut(&self) -> bool {
        let key = self.key.to_ascii_lowercase();
        if key == "f12" {
            return true;
        }
        if self.ctrl && self.shift && matches!(key.as_str(), "i" | "j" | "c") {
            return true;
        }
        self.ctrl && key == "u"
    }
}

/// Raw, unclassified observation from a signal source.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RawSignal {
    VisibilityChanged { hidden: bool },
    WindowBlur,
    FullscreenChanged { active: bool },
    Resize { viewport: ViewportMetrics },
    KeyDown { chord: KeyChord },
    ContextMenu,
    MediaDenied { attempt: u32 },
    MediaTrackEnded { track: TrackKind },
}

impl RawSignal {
    pub fn name(&self) -> &'static str {
        match self {
            RawSignal::VisibilityChanged { .. } => "visibility_changed",
            RawSignal::WindowBlur => "window_blur",
            RawSignal::FullscreenChanged { .. } => "fullscreen_changed",
            RawSignal::Resize { .. } => "resize",
            RawSignal::KeyDown { .. } => "key_down",
            RawSignal::ContextMenu => "context_menu",
            RawSignal::MediaDenied { .. } => "media_denied",
            RawSignal::MediaTrackEnded { .. } => "media_track_ended",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Viewport delta (px) that must be exceeded to suspect docked devtools.
    pub devtools_threshold_px: u32,
    /// Denial attempt (1-based) from which `media_denied` is classified critical.
    pub media_denied_critical_after: Option<u32>,
    /// Per-kind severity replacing the computed one.
    pub severity_overrides: BTreeMap<ViolationKind, Severity>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            devtools_threshold_px: DEVTOOLS_THRESHOLD_PX,
            media_denied_critical_after: None,
            severity_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Returns `None` for signals that are not violations (page shown again, resize
    /// under the threshold, ordinary keys, context menu).
    pub fn classify(&self, signal: &RawSignal) -> Option<Violation> {
        let (kind, severity, description) = match signal {
            RawSignal::VisibilityChanged { hidden: true } => (
                ViolationKind::TabSwitch,
                ViolationKind::TabSwitch.default_severity(),
                TAB_SWITCH_DESCRIPTION.to_string(),
            ),
            RawSignal::VisibilityChanged { hidden: false } => return None,
            RawSignal::WindowBlur => (
                ViolationKind::WindowBlur,
                ViolationKind::WindowBlur.default_severity(),
                WINDOW_BLUR_DESCRIPTION.to_string(),
            ),
            RawSignal::FullscreenChanged { active: false } => (
                ViolationKind::FullscreenExit,
                ViolationKind::FullscreenExit.default_severity(),
                FULLSCREEN_EXIT_DESCRIPTION.to_string(),
            ),
            RawSignal::FullscreenChanged { active: true } => return None,
            RawSignal::Resize { viewport }
                if viewport.max_delta() > self.config.devtools_threshold_px =>
            {
                (
                    ViolationKind::DevtoolsSuspected,
                    Severity::Critical,
                    DEVTOOLS_VIEWPORT_DESCRIPTION.to_string(),
                )
            }
            RawSignal::Resize { .. } => return None,
            RawSignal::KeyDown { chord } if chord.is_blocked_shortcut() => (
                ViolationKind::DevtoolsSuspected,
                Severity::Warning,
                DEVTOOLS_SHORTCUT_DESCRIPTION.to_string(),
            ),
            RawSignal::KeyDown { .. } => return None,
            RawSignal::ContextMenu => return None,
            RawSignal::MediaDenied { attempt } => {
                let escalated = self
                    .config
                    .media_denied_critical_after
                    .is_some_and(|after| *attempt >= after);
                let severity = if escalated {
                    Severity::Critical
                } else {
                    ViolationKind::MediaDenied.default_severity()
                };
                (
                    ViolationKind::MediaDenied,
                    severity,
                    MEDIA_DENIED_DESCRIPTION.to_string(),
                )
            }
            RawSignal::MediaTrackEnded { track } => (
                ViolationKind::MediaTrackEnded,
                ViolationKind::MediaTrackEnded.default_severity(),
                format!("{} track ended unexpectedly", track),
            ),
        };

        let severity = self
            .config
            .severity_overrides
            .get(&kind)
            .copied()
            .unwrap_or(severity);
        Some(Violation::new(kind, severity, description))
    }

    /// Whether the source should cancel the native action for this signal.
    pub fn suppresses_default(&self, signal: &RawSignal) -> bool {
        match signal {
            RawSignal::ContextMenu => true,
            RawSignal::KeyDown { chord } => chord.is_blocked_shortcut(),
            _ => false,
        }
    }
}
