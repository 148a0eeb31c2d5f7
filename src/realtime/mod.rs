//! Realtime notification channel.
//!
//! A single push connection shared by every consumer in the process:
//! - Heartbeats every 30s while connected
//! - Reconnects with exponential backoff unless the close code is final
//! - Polls through the sink while not connected
//! - Resyncs immediately on focus and when the network comes back

mod close_code;
mod connector;
mod frame;
mod machine;
mod manager;

pub use close_code::{CloseCode, FailureKind};
pub use connector::{ChannelError, Connector, SocketEvent, SocketLink, WsConnector};
pub use frame::{decode, InboundFrame, OutboundFrame, OutboundKind};
pub use machine::{
  ChannelEvent, ChannelMachine, ConnectionState, Effect, MachineConfig,
};
pub use manager::{ChannelLease, ConnectionManager, PushSink};
