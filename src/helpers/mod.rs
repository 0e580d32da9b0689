use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::models::WireMessage;
use crate::types::{Outbound, WsSplit};

pub async fn accept_and_split(raw_stream: TcpStream) -> Result<WsSplit, tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(raw_stream).await?;
    Ok(ws_stream.split())
}

/// Decode one text frame from the signaling socket.
///
/// Non-text frames yield `Ok(None)`; pings and closes are handled by the
/// transport.
pub fn decode_frame(msg: &Message) -> Result<Option<WireMessage>, serde_json::Error> {
    match msg {
        Message::Text(text) => serde_json::from_str(text).map(Some),
        _ => Ok(None),
    }
}

pub fn send_payload(outbound: &Outbound, message: WireMessage) -> bool {
    match outbound.unbounded_send(message) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("failed to queue signaling message: {}", err);
            false
        }
    }
}
