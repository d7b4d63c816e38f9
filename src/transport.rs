//! Signaling transport: the WebSocket connection to the voice gateway, an
//! outbound envelope pump, and the inbound read loop feeding the session.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, ServerEvent};
use crate::session::VoiceSession;
use crate::ticket::JoinTicket;

const OUTBOUND_BUFFER: usize = 64;

/// Spawns the connect-and-run loop for a joining session. Failures before
/// the read loop starts are reported into the session's error state.
pub fn spawn(session: Arc<VoiceSession>, ticket: JoinTicket) {
    tokio::spawn(async move {
        if let Err(e) = run(session.clone(), ticket).await {
            session.transport_closed(Some(format!("{:#}", e))).await;
        }
    });
}

/// Connects, sends `join`, then pumps envelopes both ways until either side
/// closes. The session learns about the close exactly once.
pub async fn run(session: Arc<VoiceSession>, ticket: JoinTicket) -> Result<()> {
    let timeout = session.connect_timeout();
    let (ws, _) = tokio::time::timeout(timeout, connect_async(&ticket.signaling_url))
        .await
        .map_err(|_| anyhow!("connect timed out after {}ms", timeout.as_millis()))?
        .context("signaling connect failed")?;
    info!(url = %ticket.signaling_url, "Signaling transport open");

    let (mut write, mut read) = ws.split();

    // join goes out before the pump owns the sink
    let join = Envelope::join(session.channel_id.as_ref().to_string(), ticket.token);
    write
        .send(WsMessage::Text(serde_json::to_string(&join)?))
        .await
        .context("join send failed")?;

    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
    session.attach_transport(tx).await;

    let writer = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            let text = match serde_json::to_string(&env) {
                Ok(text) => text,
                Err(e) => {
                    warn!(kind = %env.kind, error = %e, "Envelope serialization failed");
                    continue;
                }
            };
            if write.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        // sender dropped: the session detached the transport
        let _ = write.send(WsMessage::Close(None)).await;
    });

    let mut close_error: Option<String> = None;
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(env) => match ServerEvent::from_envelope(&env) {
                    Ok(event) => session.handle_event(event).await,
                    Err(e) => warn!(error = %e, "Malformed envelope payload"),
                },
                Err(e) => warn!(error = %e, "Unparseable signaling message"),
            },
            Ok(WsMessage::Close(frame)) => {
                debug!(frame = ?frame, "Close frame received");
                break;
            }
            // pings are answered by the websocket layer itself
            Ok(_) => {}
            Err(e) => {
                close_error = Some(e.to_string());
                break;
            }
        }
    }

    writer.abort();
    session.transport_closed(close_error).await;
    Ok(())
}
