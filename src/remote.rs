//! Remote link — websocket transport from a client session to the relay.
//!
//! DESIGN
//! ======
//! `connect` opens the relay's `/session` socket and splits it into two pump
//! tasks. The writer drains the queue behind the returned [`ChannelLink`]
//! and sends each message as one binary frame. The reader decodes binary
//! frames into the inbound queue that [`run_client`](crate::client::run_client)
//! consumes.
//!
//! The inbound queue closes when the socket does. Dropping the link closes
//! the socket, which in turn ends the reader.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::link::ChannelLink;
use crate::message::{ErrorCode, StateMessage};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tungstenite::Error>),
}

impl ErrorCode for RemoteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::WsConnect(_) => "E_WS_CONNECT",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// `ws://host/session?name=...` for a relay at `base` (`ws://host:port`).
#[must_use]
pub fn session_url(base: &str, name: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match name {
        Some(name) => format!("{base}/session?name={name}"),
        None => format!("{base}/session"),
    }
}

/// Connect to a relay session socket.
///
/// Returns the outbound link for a `Session` and the inbound queue for
/// `run_client`. Both queues hold at most `capacity` messages.
///
/// # Errors
///
/// Returns `WsConnect` when the websocket handshake fails.
pub async fn connect(url: &str, capacity: usize) -> Result<(ChannelLink, mpsc::Receiver<StateMessage>), RemoteError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| RemoteError::WsConnect(Box::new(e)))?;
    info!(url, "remote: connected");

    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<StateMessage>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<StateMessage>(capacity);

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frames::encode_message(&msg).into())).await {
                warn!(error = %e, "remote: send failed");
                return;
            }
        }
        let _ = sink.close().await;
        debug!("remote: link dropped, socket closed");
    });

    tokio::spawn(async move {
        while let Some(next) = source.next().await {
            let bytes = match next {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "remote: receive failed");
                    break;
                }
            };
            match frames::decode_message(&bytes) {
                Ok(msg) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, code = e.error_code(), "remote: undecodable frame skipped"),
            }
        }
        debug!("remote: socket closed, inbound queue closed");
    });

    Ok((ChannelLink::new(out_tx), in_rx))
}
