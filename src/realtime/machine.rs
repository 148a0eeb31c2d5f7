//! Connection lifecycle as a pure state machine.
//!
//! `ChannelMachine::transition` maps the current machine and one event to
//! the next machine and the side effects the driver must perform. Timers,
//! sockets and refreshes live in the driver; nothing here sleeps or does I/O.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::close_code::{CloseCode, FailureKind};
use super::frame::InboundFrame;
use crate::api::types::Notification;
use crate::config::RealtimeConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Connecting => "connecting",
      ConnectionState::Connected => "connected",
    })
  }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
  /// A consumer wants the connection up
  Connect,
  Opened,
  Frame(InboundFrame),
  /// Transport error. Drops to disconnected; the close that follows
  /// decides whether to reconnect.
  Error(String),
  /// Socket closed, with the close code when one was received
  Closed(Option<u16>),
  ReconnectDue,
  HeartbeatDue,
  PollDue,
  Online,
  Offline,
  Focus,
  /// No consumer wants the connection any more
  Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
  OpenSocket,
  CloseSocket,
  SendHeartbeat,
  StartHeartbeat,
  StopHeartbeat,
  StartPolling,
  StopPolling,
  ScheduleReconnect { attempt: u32, delay: Duration },
  CancelReconnect,
  /// Refetch notifications and the unread count
  Refresh,
  Deliver(Notification),
  Publish(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
  pub max_attempts: u32,
  pub network_base: Duration,
  pub server_base: Duration,
  pub policy: RetryPolicy,
}

impl Default for MachineConfig {
  fn default() -> Self {
    Self::from(&RealtimeConfig::default())
  }
}

impl From<&RealtimeConfig> for MachineConfig {
  fn from(config: &RealtimeConfig) -> Self {
    Self {
      max_attempts: config.max_reconnect_attempts,
      network_base: Duration::from_millis(config.network_base_ms),
      server_base: Duration::from_millis(config.server_base_ms),
      policy: RetryPolicy {
        max_delay: Duration::from_millis(config.max_delay_ms),
        ..RetryPolicy::default()
      },
    }
  }
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
  state: ConnectionState,
  attempts: u32,
  online: bool,
  wanted: bool,
  polling: bool,
  reconnect_pending: bool,
  /// Dropped by a transport error, the socket's close is still due
  awaiting_close: bool,
  config: MachineConfig,
}

impl Default for ChannelMachine {
  fn default() -> Self {
    Self::new(MachineConfig::default())
  }
}

impl ChannelMachine {
  pub fn new(config: MachineConfig) -> Self {
    Self {
      state: ConnectionState::Disconnected,
      attempts: 0,
      online: true,
      wanted: false,
      polling: false,
      reconnect_pending: false,
      awaiting_close: false,
      config,
    }
  }

  pub fn state(&self) -> ConnectionState {
    self.state
  }

  /// Reconnect attempts since the last successful open.
  pub fn attempts(&self) -> u32 {
    self.attempts
  }

  pub fn is_polling(&self) -> bool {
    self.polling
  }

  pub fn transition(mut self, event: ChannelEvent) -> (Self, Vec<Effect>) {
    let effects = self.step(event);
    (self, effects)
  }

  /// In-place form of [`ChannelMachine::transition`].
  pub fn step(&mut self, event: ChannelEvent) -> Vec<Effect> {
    let mut fx = Vec::new();
    match event {
      ChannelEvent::Connect => {
        self.wanted = true;
        self.ensure_polling(&mut fx);
        if self.state == ConnectionState::Disconnected && self.online {
          self.cancel_reconnect(&mut fx);
          self.open(&mut fx);
        }
      }

      ChannelEvent::Opened => {
        if self.state != ConnectionState::Connecting {
          return fx;
        }
        self.attempts = 0;
        self.set_state(ConnectionState::Connected, &mut fx);
        if self.polling {
          self.polling = false;
          fx.push(Effect::StopPolling);
        }
        fx.push(Effect::StartHeartbeat);
        fx.push(Effect::SendHeartbeat);
      }

      ChannelEvent::Frame(frame) => {
        if self.state != ConnectionState::Connected {
          return fx;
        }
        match frame {
          InboundFrame::Notification { data } => fx.push(Effect::Deliver(data)),
          InboundFrame::Pong | InboundFrame::HeartbeatAck | InboundFrame::Unknown => {}
        }
      }

      ChannelEvent::Error(message) => {
        debug!(state = %self.state, "channel error: {}", message);
        if self.state == ConnectionState::Disconnected {
          return fx;
        }
        self.drop_link(&mut fx);
        self.awaiting_close = true;
        if self.wanted {
          self.ensure_polling(&mut fx);
        }
      }

      ChannelEvent::Closed(code) => {
        let errored = std::mem::take(&mut self.awaiting_close);
        if self.state == ConnectionState::Disconnected && !errored {
          return fx;
        }
        self.drop_link(&mut fx);
        if !self.wanted {
          return fx;
        }
        self.ensure_polling(&mut fx);

        // A close without a status frame is 1005
        let code = CloseCode::from(code.unwrap_or(1005));
        self.schedule_reconnect(code, &mut fx);
      }

      ChannelEvent::ReconnectDue => {
        // Ticks of a cancelled timer can still be queued
        if !std::mem::take(&mut self.reconnect_pending) {
          return fx;
        }
        if self.wanted && self.online && self.state == ConnectionState::Disconnected {
          self.open(&mut fx);
        }
      }

      ChannelEvent::HeartbeatDue => {
        if self.state == ConnectionState::Connected {
          fx.push(Effect::SendHeartbeat);
        }
      }

      ChannelEvent::PollDue => {
        if self.wanted && self.state != ConnectionState::Connected {
          fx.push(Effect::Refresh);
        }
      }

      ChannelEvent::Online => {
        self.online = true;
        // Connectivity is back: the reconnect budget starts over
        self.attempts = 0;
        self.resync(&mut fx);
      }

      ChannelEvent::Focus => self.resync(&mut fx),

      ChannelEvent::Offline => {
        self.online = false;
        self.cancel_reconnect(&mut fx);
      }

      ChannelEvent::Disconnect => {
        self.wanted = false;
        self.attempts = 0;
        self.awaiting_close = false;
        self.cancel_reconnect(&mut fx);
        if self.polling {
          self.polling = false;
          fx.push(Effect::StopPolling);
        }
        if self.state == ConnectionState::Connected {
          fx.push(Effect::StopHeartbeat);
        }
        if self.state != ConnectionState::Disconnected {
          fx.push(Effect::CloseSocket);
          self.set_state(ConnectionState::Disconnected, &mut fx);
        }
      }
    }
    fx
  }

  fn set_state(&mut self, state: ConnectionState, fx: &mut Vec<Effect>) {
    if self.state != state {
      self.state = state;
      fx.push(Effect::Publish(state));
    }
  }

  /// Leave the current socket behind: no more heartbeats, state goes to
  /// disconnected.
  fn drop_link(&mut self, fx: &mut Vec<Effect>) {
    if self.state == ConnectionState::Connected {
      fx.push(Effect::StopHeartbeat);
    }
    self.set_state(ConnectionState::Disconnected, fx);
  }

  fn open(&mut self, fx: &mut Vec<Effect>) {
    // A new socket supersedes the errored one
    self.awaiting_close = false;
    self.set_state(ConnectionState::Connecting, fx);
    fx.push(Effect::OpenSocket);
  }

  fn ensure_polling(&mut self, fx: &mut Vec<Effect>) {
    if !self.polling && self.state != ConnectionState::Connected {
      self.polling = true;
      fx.push(Effect::StartPolling);
    }
  }

  fn cancel_reconnect(&mut self, fx: &mut Vec<Effect>) {
    if self.reconnect_pending {
      self.reconnect_pending = false;
      fx.push(Effect::CancelReconnect);
    }
  }

  /// Refresh now and, when disconnected, reconnect without waiting for the
  /// backoff timer.
  fn resync(&mut self, fx: &mut Vec<Effect>) {
    if !self.wanted {
      return;
    }
    fx.push(Effect::Refresh);
    if self.online && self.state == ConnectionState::Disconnected {
      self.cancel_reconnect(fx);
      self.open(fx);
    }
  }

  fn schedule_reconnect(&mut self, code: CloseCode, fx: &mut Vec<Effect>) {
    if !code.should_reconnect() {
      debug!(code = %code, "closed for good, not reconnecting");
      return;
    }
    if !self.online {
      debug!(code = %code, "offline, waiting for connectivity");
      return;
    }
    if self.attempts >= self.config.max_attempts {
      warn!(
        attempts = self.attempts,
        code = %code,
        "giving up on reconnecting, polling only"
      );
      return;
    }

    let base = match code.failure_kind() {
      FailureKind::Network => self.config.network_base,
      FailureKind::Server => self.config.server_base,
    };
    let delay = self.config.policy.backoff_from(base, self.attempts);
    self.attempts += 1;
    self.reconnect_pending = true;
    debug!(
      code = %code,
      attempt = self.attempts,
      delay_ms = delay.as_millis() as u64,
      "scheduling reconnect"
    );
    fx.push(Effect::ScheduleReconnect {
      attempt: self.attempts,
      delay,
    });
  }
}
