use futures_channel::mpsc::unbounded;
use futures_util::{future, pin_mut, stream::TryStreamExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    helpers::{accept_and_split, decode_frame},
    models::WireMessage,
    registry::{relay_or_log, SessionRegistry},
    types::{ConnectionId, Tx},
};

/// Accept signaling connections until the listener fails.
pub async fn serve_signaling(listener: TcpListener, registry: Arc<SessionRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(registry.clone(), stream, addr));
            }
            Err(err) => {
                warn!("signaling accept failed: {}", err);
                break;
            }
        }
    }
}

pub async fn handle_connection(registry: Arc<SessionRegistry>, raw_stream: TcpStream, addr: SocketAddr) {
    debug!(%addr, "incoming TCP connection");

    let (outgoing, incoming) = match accept_and_split(raw_stream).await {
        Ok(split) => split,
        Err(err) => {
            warn!(%addr, "websocket handshake failed: {}", err);
            return;
        }
    };

    let conn = registry.next_connection_id();
    let (tx, rx) = unbounded();
    info!(%addr, connection = conn, "websocket connection established");

    let broadcast_incoming = incoming.try_for_each(|msg| {
        handle_frame(&registry, conn, &tx, &msg);
        future::ok(())
    });

    let receive_from_others = rx.map(Ok).forward(outgoing);

    pin_mut!(broadcast_incoming, receive_from_others);
    future::select(broadcast_incoming, receive_from_others).await;

    registry.leave(conn);
    info!(%addr, connection = conn, "websocket connection closed");
}

fn handle_frame(registry: &SessionRegistry, conn: ConnectionId, tx: &Tx, msg: &Message) {
    match decode_frame(msg) {
        Ok(Some(WireMessage::Join(request))) => {
            if let Err(err) = registry.join(conn, tx.clone(), request) {
                warn!(connection = conn, "dropping join: {}", err);
            }
        }
        Ok(Some(WireMessage::Signal(signal))) => relay_or_log(registry, conn, signal),
        Ok(None) => {}
        Err(err) => warn!(connection = conn, "dropping frame: {}", RelayError::from(err)),
    }
}
