//! Socket transport behind the channel driver.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::auth::TokenSource;

#[derive(Debug, Error)]
pub enum ChannelError {
  #[error("no auth token available")]
  MissingToken,
  #[error("handshake rejected with HTTP {0}")]
  Rejected(u16),
  #[error("transport error: {0}")]
  Transport(String),
}

impl ChannelError {
  /// The close code this failure is treated as.
  pub fn close_code(&self) -> u16 {
    match self {
      ChannelError::MissingToken => 1008,
      ChannelError::Rejected(401 | 403) => 1008,
      ChannelError::Rejected(status) if *status >= 500 => 1011,
      _ => 1006,
    }
  }
}

impl From<tungstenite::Error> for ChannelError {
  fn from(err: tungstenite::Error) -> Self {
    match err {
      tungstenite::Error::Http(response) => ChannelError::Rejected(response.status().as_u16()),
      other => ChannelError::Transport(other.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
  Text(String),
  /// The socket is gone. Carries the peer's close code when one was sent.
  Closed(Option<u16>),
  Error(String),
}

/// One open socket as seen by the driver.
///
/// Dropping `outbound` closes the socket with a normal closure.
#[derive(Debug)]
pub struct SocketLink {
  pub outbound: mpsc::UnboundedSender<String>,
  pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self) -> Result<SocketLink, ChannelError>;
}

/// WebSocket connector. The auth token travels as a `token` query parameter.
pub struct WsConnector {
  url: Url,
  tokens: Arc<dyn TokenSource>,
}

impl WsConnector {
  pub fn new(url: Url, tokens: Arc<dyn TokenSource>) -> Self {
    Self { url, tokens }
  }

  fn authorized_url(&self) -> Result<Url, ChannelError> {
    let token = self.tokens.token().ok_or(ChannelError::MissingToken)?;
    let mut url = self.url.clone();
    url.query_pairs_mut().append_pair("token", &token);
    Ok(url)
  }
}

#[async_trait]
impl Connector for WsConnector {
  async fn connect(&self) -> Result<SocketLink, ChannelError> {
    let url = self.authorized_url()?;
    debug!(host = url.host_str().unwrap_or_default(), "opening push channel");
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!(host = url.host_str().unwrap_or_default(), "push channel open");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();
    tokio::spawn(pump(ws_stream, out_rx, in_tx));

    Ok(SocketLink {
      outbound: out_tx,
      inbound: in_rx,
    })
  }
}

/// Move frames between the socket and the link channels until either side
/// goes away.
async fn pump(
  ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
  mut outbound: mpsc::UnboundedReceiver<String>,
  inbound: mpsc::UnboundedSender<SocketEvent>,
) {
  let (mut ws_sender, mut ws_receiver) = ws_stream.split();

  loop {
    tokio::select! {
      out = outbound.recv() => match out {
        Some(text) => {
          if let Err(err) = ws_sender.send(Message::Text(text)).await {
            let _ = inbound.send(SocketEvent::Error(err.to_string()));
          }
        }
        None => {
          let frame = CloseFrame {
            code: WsCloseCode::Normal,
            reason: "client disconnect".into(),
          };
          let _ = ws_sender.send(Message::Close(Some(frame))).await;
          break;
        }
      },
      msg = ws_receiver.next() => match msg {
        Some(Ok(Message::Text(text))) => {
          if inbound.send(SocketEvent::Text(text)).is_err() {
            break;
          }
        }
        Some(Ok(Message::Binary(data))) => {
          if let Ok(text) = String::from_utf8(data) {
            if inbound.send(SocketEvent::Text(text)).is_err() {
              break;
            }
          }
        }
        Some(Ok(Message::Close(frame))) => {
          let _ = inbound.send(SocketEvent::Closed(frame.map(|f| u16::from(f.code))));
          break;
        }
        Some(Ok(_)) => {}
        Some(Err(err)) => {
          let _ = inbound.send(SocketEvent::Error(err.to_string()));
          let _ = inbound.send(SocketEvent::Closed(Some(1006)));
          break;
        }
        None => {
          // Stream ended without a close frame
          let _ = inbound.send(SocketEvent::Closed(Some(1006)));
          break;
        }
      },
    }
  }
}
