use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::ParticipantId;

/// WebSocket connection to the rendezvous server.
///
/// Frames are JSON text in both directions. Dropping the client (and every
/// [`sender`](Self::sender) clone) closes the socket, which the server treats
/// as a disconnect.
pub struct SignalingClient {
    local: ParticipantId,
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    /// Connects and waits for the `connected` greeting carrying our id.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming_tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("failed to encode client message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("unreadable server frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("signaling socket error: {}", e);
                        break;
                    }
                }
            }
        });

        let local = match rx.recv().await {
            Some(ServerMessage::Connected { participant_id }) => participant_id,
            Some(other) => bail!("expected connected greeting, got {:?}", other),
            None => bail!("connection closed before greeting"),
        };
        tracing::debug!(participant = %local.short(), "signaling connected");

        Ok(Self { local, tx, rx })
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("signaling connection closed"))
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Split into the outgoing sender and the incoming stream, e.g. to hand
    /// the stream to [`CallSession::run`](super::CallSession::run).
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.tx, self.rx)
    }
}
