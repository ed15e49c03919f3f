//! User-facing notices raised by the escalation policy and the permission flow.

use std::sync::{Arc, Mutex};

use crate::{lock_or_recover, Severity};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// A violation was counted against the warning budget.
    Warning {
        severity: Severity,
        description: String,
        violation_count: u32,
        max_warnings: u32,
    },
    /// The session was disqualified.
    Terminated { reason: String },
    /// Camera or microphone capture was refused.
    PermissionsRequired,
}

impl Notice {
    pub fn title(&self) -> &'static str {
        match self {
            Notice::Warning {
                severity: Severity::Warning,
                ..
            } => "Warning",
            Notice::Warning { .. } => "Critical Warning",
            Notice::Terminated { .. } => "Exam Terminated",
            Notice::PermissionsRequired => "Permissions Required",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notice::Warning {
                description,
                violation_count,
                max_warnings,
                ..
            } => format!(
                "{} ({}/{} warnings)",
                description, violation_count, max_warnings
            ),
            Notice::Terminated { reason } => {
                format!("Your exam has been terminated: {}", reason)
            }
            Notice::PermissionsRequired => {
                "Camera and microphone access is required to take this exam".to_string()
            }
        }
    }

    /// Terminal notices stay on screen until dismissed.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Notice::Terminated { .. })
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title(), self.message())
    }
}

/// Presentation seam for notices (toast, modal, terminal line).
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Writes notices to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Warning {
                severity: Severity::Warning,
                ..
            } => log::info!("{}", notice),
            Notice::Warning { .. } | Notice::PermissionsRequired => log::warn!("{}", notice),
            Notice::Terminated { .. } => log::error!("{}", notice),
        }
    }
}

/// Records every notice for later inspection.
#[derive(Clone, Debug, Default)]
pub struct CollectingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock_or_recover(&self.notices).clone()
    }

    pub fn count(&self) -> usize {
        self.notices().len()
    }

    pub fn terminations(&self) -> usize {
        self.notices()
            .iter()
            .filter(|n| matches!(n, Notice::Terminated { .. }))
            .count()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: &Notice) {
        lock_or_recover(&self.notices).push(notice.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_follow_severity() {
        let warning = Notice::Warning {
            severity: Severity::Warning,
            description: "Window lost focus".into(),
            violation_count: 1,
            max_warnings: 3,
        };
        let critical = Notice::Warning {
            severity: Severity::Critical,
            description: "Exited fullscreen mode".into(),
            violation_count: 2,
            max_warnings: 3,
        };
        assert_eq!(warning.title(), "Warning");
        assert_eq!(warning.message(), "Window lost focus (1/3 warnings)");
        assert_eq!(critical.title(), "Critical Warning");
        assert!(!critical.is_blocking());

        let terminated = Notice::Terminated {
            reason: "Maximum violations exceeded".into(),
        };
        assert_eq!(terminated.title(), "Exam Terminated");
        assert!(terminated.message().contains("Maximum violations exceeded"));
        assert!(terminated.is_blocking());
        assert_eq!(Notice::PermissionsRequired.title(), "Permissions Required");
    }

    #[test]
    fn collecting_notifier_shares_storage_across_clones() {
        let notifier = CollectingNotifier::new();
        let handle = notifier.clone();
        notifier.notify(&Notice::PermissionsRequired);
        notifier.notify(&Notice::Terminated { reason: "x".into() });
        assert_eq!(handle.count(), 2);
        assert_eq!(handle.terminations(), 1);
    }
}
