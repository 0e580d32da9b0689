use futures_channel::mpsc::UnboundedSender;
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::models::WireMessage;

/// Outbound half of a participant's socket, as held by the hub.
pub type Tx = UnboundedSender<Message>;

/// Outbound signaling queue of an endpoint (controller, camera or display).
pub type Outbound = UnboundedSender<WireMessage>;

pub type ConnectionId = u64;

pub type WsSplit = (
    SplitSink<WebSocketStream<TcpStream>, Message>,
    SplitStream<WebSocketStream<TcpStream>>,
);
