//! WebSocket client side of the relay, used to run an endpoint against a
//! hub.

use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use futures_util::{future, pin_mut, SinkExt, StreamExt, TryStreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use crate::helpers::decode_frame;
use crate::models::{SignalMessage, WireMessage};
use crate::types::Outbound;

/// A connected signaling socket.
///
/// Anything queued on `outbound` is written as a text frame; every relayed
/// signal shows up on `inbound`. `inbound` ends when the socket closes.
pub struct SignalClient {
    pub outbound: Outbound,
    pub inbound: UnboundedReceiver<SignalMessage>,
    pub task: JoinHandle<()>,
}

impl SignalClient {
    /// ```no_run
    /// # tokio_test::block_on(async {
    /// use prostream_hub::client::SignalClient;
    /// use prostream_hub::models::{JoinRequest, Role, WireMessage};
    ///
    /// let client = SignalClient::connect("ws://127.0.0.1:8080").await?;
    /// client.outbound.unbounded_send(WireMessage::Join(JoinRequest {
    ///     session_id: "abc".into(),
    ///     role: Role::Display,
    ///     slot_id: None,
    /// }))?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// # }).unwrap();
    /// ```
    pub async fn connect(url: &str) -> Result<Self, tungstenite::Error> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, read) = ws_stream.split();

        let (outbound, outgoing) = unbounded::<WireMessage>();
        let (inbound_tx, inbound) = unbounded::<SignalMessage>();

        let task = tokio::spawn(async move {
            let send_outgoing = async {
                let mut outgoing = outgoing.map(|message| Ok(Message::Text(message.to_text())));
                if let Err(err) = write.send_all(&mut outgoing).await {
                    debug!("signaling socket closed while sending: {}", err);
                }
                let _ = write.close().await;
            };

            let receive = read.try_for_each(|msg| {
                match decode_frame(&msg) {
                    Ok(Some(WireMessage::Signal(signal))) => {
                        let _ = inbound_tx.unbounded_send(signal);
                    }
                    Ok(_) => {}
                    Err(err) => warn!("ignoring malformed frame from hub: {}", err),
                }
                future::ok(())
            });

            pin_mut!(send_outgoing, receive);
            future::select(send_outgoing, receive).await;
        });

        Ok(SignalClient {
            outbound,
            inbound,
            task,
        })
    }
}
