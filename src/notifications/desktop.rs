use crate::api::types::{Notification, Preferences};

/// Whether the user allowed desktop notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
  Granted,
  Denied,
  /// Never asked
  Default,
}

/// Platform surface for pushed notifications.
pub trait DesktopNotifier: Send + Sync {
  fn permission(&self) -> Permission;
  fn show(&self, notification: &Notification);
}

/// Whether a pushed notification passes the user's desktop preferences.
pub fn wants_desktop(prefs: &Preferences, n: &Notification) -> bool {
  prefs.desktop_enabled
    && n.priority >= prefs.min_priority
    && !prefs
      .muted_categories
      .iter()
      .any(|c| c.eq_ignore_ascii_case(&n.category))
}
