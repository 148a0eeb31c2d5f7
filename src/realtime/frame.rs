//! Push channel wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::types::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
  Ping,
  Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundFrame {
  #[serde(rename = "type")]
  pub kind: OutboundKind,
  /// Milliseconds since the epoch
  pub timestamp: i64,
}

impl OutboundFrame {
  pub fn heartbeat(now: DateTime<Utc>) -> Self {
    Self {
      kind: OutboundKind::Heartbeat,
      timestamp: now.timestamp_millis(),
    }
  }

  pub fn ping(now: DateTime<Utc>) -> Self {
    Self {
      kind: OutboundKind::Ping,
      timestamp: now.timestamp_millis(),
    }
  }

  pub fn to_text(&self) -> String {
    // A two-field struct of plain values always serializes
    serde_json::to_string(self).unwrap_or_default()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
  Notification { data: Notification },
  Pong,
  HeartbeatAck,
  #[serde(other)]
  Unknown,
}

/// Decode a text frame. Malformed frames are logged and dropped.
pub fn decode(text: &str) -> Option<InboundFrame> {
  let value: Value = match serde_json::from_str(text) {
    Ok(value) => value,
    Err(err) => {
      warn!("dropping malformed frame: {}", err);
      return None;
    }
  };
  let kind = value
    .get("type")
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_string();

  match InboundFrame::deserialize(value) {
    Ok(InboundFrame::Unknown) => {
      debug!(kind = %kind, "ignoring unknown frame type");
      Some(InboundFrame::Unknown)
    }
    Ok(frame) => Some(frame),
    Err(err) => {
      warn!(kind = %kind, "dropping undecodable frame: {}", err);
      None
    }
  }
}
