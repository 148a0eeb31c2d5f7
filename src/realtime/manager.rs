//! One shared push connection per process.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connector::{ChannelError, Connector, SocketEvent, SocketLink};
use super::frame::{self, OutboundFrame};
use super::machine::{ChannelEvent, ChannelMachine, ConnectionState, Effect, MachineConfig};
use crate::api::types::Notification;
use crate::config::RealtimeConfig;

/// Receiver of what the channel produces.
#[async_trait]
pub trait PushSink: Send + Sync {
  /// A notification pushed by the server.
  async fn deliver(&self, notification: Notification);

  /// Refetch state that may have been missed (polling, focus, online).
  async fn resync(&self);
}

enum DriverMsg {
  Event(ChannelEvent),
  Linked { generation: u64, link: SocketLink },
  ConnectFailed { generation: u64, error: ChannelError },
  Socket { generation: u64, event: SocketEvent },
  Shutdown,
}

struct Inner {
  commands: mpsc::UnboundedSender<DriverMsg>,
  state: watch::Receiver<ConnectionState>,
  leases: Mutex<usize>,
  sink: Arc<dyn PushSink>,
  driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    if let Some(driver) = self.driver.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
      driver.abort();
    }
  }
}

/// Owner of the single push connection.
///
/// Construct one per process and hand clones to consumers. Each consumer
/// holds a [`ChannelLease`] while it needs live updates; the socket opens
/// with the first lease and closes when the last one is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
  inner: Arc<Inner>,
}

impl ConnectionManager {
  /// Start the driver task. Must be called inside a tokio runtime.
  pub fn new(
    connector: Arc<dyn Connector>,
    sink: Arc<dyn PushSink>,
    config: &RealtimeConfig,
  ) -> Self {
    let (commands, rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

    let driver = Driver {
      machine: ChannelMachine::new(MachineConfig::from(config)),
      connector,
      sink: sink.clone(),
      commands: commands.clone(),
      state: state_tx,
      generation: 0,
      outbound: None,
      tasks: Tasks::default(),
      heartbeat_interval: config.heartbeat_interval(),
      poll_interval: config.poll_interval(),
    };
    let handle = tokio::spawn(driver.run(rx));

    Self {
      inner: Arc::new(Inner {
        commands,
        state,
        leases: Mutex::new(0),
        sink,
        driver: Mutex::new(Some(handle)),
      }),
    }
  }

  /// Register a consumer. The first lease opens the connection.
  pub fn attach(&self) -> ChannelLease {
    let mut leases = self.inner.leases.lock().unwrap_or_else(PoisonError::into_inner);
    *leases += 1;
    debug!(leases = *leases, "channel lease acquired");
    if *leases == 1 {
      self.send(ChannelEvent::Connect);
    }
    ChannelLease {
      manager: self.clone(),
    }
  }

  fn release(&self) {
    let mut leases = self.inner.leases.lock().unwrap_or_else(PoisonError::into_inner);
    *leases = leases.saturating_sub(1);
    debug!(leases = *leases, "channel lease released");
    if *leases == 0 {
      self.send(ChannelEvent::Disconnect);
    }
  }

  pub fn lease_count(&self) -> usize {
    *self.inner.leases.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> ConnectionState {
    *self.inner.state.borrow()
  }

  /// Follow state changes.
  pub fn watch(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state.clone()
  }

  pub fn network_online(&self) {
    self.send(ChannelEvent::Online);
  }

  pub fn network_offline(&self) {
    self.send(ChannelEvent::Offline);
  }

  pub fn focus(&self) {
    self.send(ChannelEvent::Focus);
  }

  /// Manual refresh through the sink, independent of the connection.
  pub async fn refresh(&self) {
    self.inner.sink.resync().await;
  }

  /// Close the connection and stop the driver. Leases outliving this are
  /// inert.
  pub fn shutdown(&self) {
    self.send(ChannelEvent::Disconnect);
    let _ = self.inner.commands.send(DriverMsg::Shutdown);
  }

  fn send(&self, event: ChannelEvent) {
    if self.inner.commands.send(DriverMsg::Event(event)).is_err() {
      debug!("channel driver already stopped");
    }
  }
}

/// Keeps the shared connection wanted while alive.
pub struct ChannelLease {
  manager: ConnectionManager,
}

impl ChannelLease {
  pub fn manager(&self) -> &ConnectionManager {
    &self.manager
  }

  pub fn state(&self) -> ConnectionState {
    self.manager.state()
  }

  pub fn watch(&self) -> watch::Receiver<ConnectionState> {
    self.manager.watch()
  }

  pub fn network_online(&self) {
    self.manager.network_online();
  }

  pub fn network_offline(&self) {
    self.manager.network_offline();
  }

  pub fn focus(&self) {
    self.manager.focus();
  }

  pub async fn refresh(&self) {
    self.manager.refresh().await;
  }
}

impl Drop for ChannelLease {
  fn drop(&mut self) {
    self.manager.release();
  }
}

#[derive(Default)]
struct Tasks {
  connecting: Option<JoinHandle<()>>,
  reader: Option<JoinHandle<()>>,
  heartbeat: Option<JoinHandle<()>>,
  polling: Option<JoinHandle<()>>,
  reconnect: Option<JoinHandle<()>>,
}

fn stop(task: &mut Option<JoinHandle<()>>) {
  if let Some(task) = task.take() {
    task.abort();
  }
}

impl Tasks {
  fn stop_all(&mut self) {
    stop(&mut self.connecting);
    stop(&mut self.reader);
    stop(&mut self.heartbeat);
    stop(&mut self.polling);
    stop(&mut self.reconnect);
  }
}

/// Owns the machine and performs its effects. Runs as one task; every
/// input arrives through `commands`.
struct Driver {
  machine: ChannelMachine,
  connector: Arc<dyn Connector>,
  sink: Arc<dyn PushSink>,
  commands: mpsc::UnboundedSender<DriverMsg>,
  state: watch::Sender<ConnectionState>,
  /// Identifies the current socket; messages from older ones are dropped
  generation: u64,
  outbound: Option<mpsc::UnboundedSender<String>>,
  tasks: Tasks,
  heartbeat_interval: Duration,
  poll_interval: Duration,
}

impl Driver {
  async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DriverMsg>) {
    while let Some(msg) = rx.recv().await {
      match msg {
        DriverMsg::Event(event) => self.handle(event).await,

        DriverMsg::Linked { generation, link } => {
          if generation != self.generation {
            debug!(generation, "dropping superseded socket");
            continue;
          }
          self.tasks.connecting = None;
          self.outbound = Some(link.outbound);
          self.tasks.reader = Some(self.forward(generation, link.inbound));
          self.handle(ChannelEvent::Opened).await;
        }

        DriverMsg::ConnectFailed { generation, error } => {
          if generation != self.generation {
            continue;
          }
          self.tasks.connecting = None;
          warn!("push channel connect failed: {}", error);
          self.handle(ChannelEvent::Closed(Some(error.close_code()))).await;
        }

        DriverMsg::Socket { generation, event } => {
          if generation != self.generation {
            continue;
          }
          match event {
            SocketEvent::Text(text) => {
              if let Some(frame) = frame::decode(&text) {
                self.handle(ChannelEvent::Frame(frame)).await;
              }
            }
            SocketEvent::Error(message) => {
              warn!("push channel error: {}", message);
              self.handle(ChannelEvent::Error(message)).await;
            }
            SocketEvent::Closed(code) => {
              self.drop_socket();
              info!(code = ?code, "push channel closed");
              self.handle(ChannelEvent::Closed(code)).await;
            }
          }
        }

        DriverMsg::Shutdown => break,
      }
    }

    self.drop_socket();
    self.tasks.stop_all();
    debug!("channel driver stopped");
  }

  async fn handle(&mut self, event: ChannelEvent) {
    for effect in self.machine.step(event) {
      self.apply(effect).await;
    }
  }

  async fn apply(&mut self, effect: Effect) {
    match effect {
      Effect::OpenSocket => self.open_socket(),
      Effect::CloseSocket => self.drop_socket(),
      Effect::SendHeartbeat => {
        if let Some(outbound) = &self.outbound {
          let _ = outbound.send(OutboundFrame::heartbeat(Utc::now()).to_text());
        }
      }
      Effect::StartHeartbeat => {
        stop(&mut self.tasks.heartbeat);
        self.tasks.heartbeat = Some(self.ticker(self.heartbeat_interval, ChannelEvent::HeartbeatDue));
      }
      Effect::StopHeartbeat => stop(&mut self.tasks.heartbeat),
      Effect::StartPolling => {
        stop(&mut self.tasks.polling);
        self.tasks.polling = Some(self.ticker(self.poll_interval, ChannelEvent::PollDue));
      }
      Effect::StopPolling => stop(&mut self.tasks.polling),
      Effect::ScheduleReconnect { attempt, delay } => {
        stop(&mut self.tasks.reconnect);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting push channel");
        let commands = self.commands.clone();
        self.tasks.reconnect = Some(tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          let _ = commands.send(DriverMsg::Event(ChannelEvent::ReconnectDue));
        }));
      }
      Effect::CancelReconnect => stop(&mut self.tasks.reconnect),
      Effect::Refresh => {
        let sink = self.sink.clone();
        tokio::spawn(async move { sink.resync().await });
      }
      Effect::Deliver(notification) => self.sink.deliver(notification).await,
      Effect::Publish(state) => {
        debug!(state = %state, "connection state");
        self.state.send_replace(state);
      }
    }
  }

  fn open_socket(&mut self) {
    self.drop_socket();
    let generation = self.generation;
    let connector = self.connector.clone();
    let commands = self.commands.clone();
    self.tasks.connecting = Some(tokio::spawn(async move {
      let msg = match connector.connect().await {
        Ok(link) => DriverMsg::Linked { generation, link },
        Err(error) => DriverMsg::ConnectFailed { generation, error },
      };
      let _ = commands.send(msg);
    }));
  }

  /// Forget the current socket. Dropping the outbound sender closes it.
  fn drop_socket(&mut self) {
    self.generation += 1;
    self.outbound = None;
    stop(&mut self.tasks.connecting);
    stop(&mut self.tasks.reader);
  }

  fn forward(
    &self,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
  ) -> JoinHandle<()> {
    let commands = self.commands.clone();
    tokio::spawn(async move {
      while let Some(event) = inbound.recv().await {
        let closed = matches!(event, SocketEvent::Closed(_));
        if commands.send(DriverMsg::Socket { generation, event }).is_err() || closed {
          return;
        }
      }
      // Link dropped without a close event
      let _ = commands.send(DriverMsg::Socket {
        generation,
        event: SocketEvent::Closed(Some(1006)),
      });
    })
  }

  fn ticker(&self, period: Duration, event: ChannelEvent) -> JoinHandle<()> {
    let commands = self.commands.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        ticker.tick().await;
        if commands.send(DriverMsg::Event(event.clone())).is_err() {
          return;
        }
      }
    })
  }
}
