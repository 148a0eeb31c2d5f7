use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::types::{Notification, Priority};

/// Notifications sharing a type and category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationGroup {
  #[serde(rename = "type")]
  pub kind: String,
  pub category: String,
  /// Highest priority among the members
  pub priority: Priority,
  pub count: usize,
  pub unread: usize,
  pub latest: DateTime<Utc>,
  pub ids: Vec<u64>,
}

/// Group by `(type, category)`. Groups come back most urgent first, then
/// most recent first.
pub fn group_notifications(items: &[Notification]) -> Vec<NotificationGroup> {
  let mut groups: BTreeMap<(&str, &str), NotificationGroup> = BTreeMap::new();

  for n in items {
    let group = groups
      .entry((n.kind.as_str(), n.category.as_str()))
      .or_insert_with(|| NotificationGroup {
        kind: n.kind.clone(),
        category: n.category.clone(),
        priority: n.priority,
        count: 0,
        unread: 0,
        latest: n.created_at,
        ids: Vec::new(),
      });

    group.priority = group.priority.max(n.priority);
    group.latest = group.latest.max(n.created_at);
    group.count += 1;
    if !n.is_read {
      group.unread += 1;
    }
    group.ids.push(n.id);
  }

  let mut groups: Vec<NotificationGroup> = groups.into_values().collect();
  groups.sort_by(|a, b| {
    b.priority
      .rank()
      .cmp(&a.priority.rank())
      .then_with(|| b.latest.cmp(&a.latest))
  });
  groups
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notifications::testing::sample;
  use chrono::Duration;

  #[test]
  fn test_group_priority_is_highest_rank() {
    let mut a = sample(1, false);
    a.priority = Priority::Low;
    let mut b = sample(2, true);
    b.priority = Priority::Critical;
    let mut c = sample(3, false);
    c.priority = Priority::Medium;

    let groups = group_notifications(&[a, b, c]);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].priority, Priority::Critical);
    assert_eq!(groups[0].count, 3);
    assert_eq!(groups[0].unread, 2);
    assert_eq!(groups[0].ids, vec![1, 2, 3]);
  }

  #[test]
  fn test_groups_split_by_type_and_category() {
    let a = sample(1, false);
    let mut b = sample(2, false);
    b.category = "billing".to_string();
    b.priority = Priority::High;
    let mut c = sample(3, false);
    c.kind = "alert".to_string();
    c.created_at = a.created_at + Duration::minutes(5);

    let groups = group_notifications(&[a, b, c]);
    assert_eq!(groups.len(), 3);
    // High first, then the two medium groups by recency
    assert_eq!(groups[0].category, "billing");
    assert_eq!(groups[1].kind, "alert");
    assert_eq!(groups[2].ids, vec![1]);
  }
}
