//! Notification types as exchanged with the backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification priority. Variants are declared in ascending rank so the
/// derived ordering puts `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

impl Priority {
  pub fn rank(self) -> u8 {
    match self {
      Priority::Low => 0,
      Priority::Medium => 1,
      Priority::High => 2,
      Priority::Critical => 3,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Critical => "critical",
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "low" => Ok(Priority::Low),
      "medium" => Ok(Priority::Medium),
      "high" => Ok(Priority::High),
      "critical" => Ok(Priority::Critical),
      other => Err(format!("unknown priority '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub message: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub priority: Priority,
  pub category: String,
  #[serde(default)]
  pub is_read: bool,
  #[serde(default)]
  pub dismissed: bool,
  pub created_at: DateTime<Utc>,
}

/// List filter. Also part of the list's cache key, so field order matters
/// for nothing but readability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_read: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<Priority>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dismissed: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<u32>,
}

impl NotificationFilter {
  /// Query-string pairs for the list endpoint.
  pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(v) = self.is_read {
      pairs.push(("isRead", v.to_string()));
    }
    if let Some(v) = &self.category {
      pairs.push(("category", v.clone()));
    }
    if let Some(v) = self.priority {
      pairs.push(("priority", v.to_string()));
    }
    if let Some(v) = &self.search {
      pairs.push(("search", v.clone()));
    }
    if let Some(v) = self.dismissed {
      pairs.push(("dismissed", v.to_string()));
    }
    if let Some(v) = self.page {
      pairs.push(("page", v.to_string()));
    }
    if let Some(v) = self.limit {
      pairs.push(("limit", v.to_string()));
    }
    pairs
  }

  /// Whether a pushed notification belongs in a list fetched with this filter.
  pub fn matches(&self, n: &Notification) -> bool {
    if self.is_read.is_some_and(|r| r != n.is_read) {
      return false;
    }
    if self.dismissed.is_some_and(|d| d != n.dismissed) {
      return false;
    }
    if self.priority.is_some_and(|p| p != n.priority) {
      return false;
    }
    if let Some(category) = &self.category {
      if !category.eq_ignore_ascii_case(&n.category) {
        return false;
      }
    }
    if let Some(search) = &self.search {
      let needle = search.to_lowercase();
      if !n.title.to_lowercase().contains(&needle) && !n.message.to_lowercase().contains(&needle)
      {
        return false;
      }
    }
    true
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
  pub items: Vec<Notification>,
  #[serde(default)]
  pub total: u64,
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
  pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
  pub total: u64,
  pub unread: u64,
  #[serde(default)]
  pub by_priority: BTreeMap<String, u64>,
  #[serde(default)]
  pub by_category: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
  #[serde(default = "default_true")]
  pub desktop_enabled: bool,
  #[serde(default)]
  pub email_enabled: bool,
  /// Notifications below this priority are not shown on the desktop
  #[serde(default = "default_min_priority")]
  pub min_priority: Priority,
  #[serde(default)]
  pub muted_categories: Vec<String>,
}

fn default_true() -> bool {
  true
}

fn default_min_priority() -> Priority {
  Priority::Low
}

impl Default for Preferences {
  fn default() -> Self {
    Self {
      desktop_enabled: true,
      email_enabled: false,
      min_priority: Priority::Low,
      muted_categories: Vec::new(),
    }
  }
}
