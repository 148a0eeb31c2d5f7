//! Notification subsystem: cached list and unread count, optimistic
//! read/dismiss writes, grouping and the desktop surface.

mod center;
mod desktop;
mod grouping;

#[cfg(test)]
pub(crate) mod testing;

pub use center::{
  list_key, preferences_key, stats_key, unread_key, NotificationCenter, NotificationWatch,
};
pub use desktop::{wants_desktop, DesktopNotifier, Permission};
pub use grouping::{group_notifications, NotificationGroup};
