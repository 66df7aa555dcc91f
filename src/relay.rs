//! Relay server — websocket fan-out with the authoritative endpoint table.
//!
//! DESIGN
//! ======
//! Every connection gets a server-assigned numeric endpoint id and its own
//! bounded outbound queue, registered in the `Hub` that the authoritative
//! `CollaborationManager` uses as its link. Inbound binary frames are
//! decoded and handled by `process_inbound`, which returns the replies for
//! the sender; everything meant for peers leaves through the hub.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → attach queue → queue `welcome` with the endpoint id
//! 2. `connect` → membership snapshot to every endpoint
//! 3. Frames in → `process_inbound` → replies to sender, relay to peers
//! 4. Close → detach queue → `disconnect` → re-election + snapshot
//!
//! RULES
//! =====
//! - Chat is re-stamped with the sender's id before relay.
//! - `welcome` is only ever sent by the relay.
//! - Proxy state (`USER_DATA`) is accepted from the master only, except
//!   in-situ coupling traffic.
//! - Membership proposals are merged, never relayed; a refused proposal
//!   gets an error reply plus the authoritative snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::get;
use tokio::sync::{RwLock, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::collaboration::{CollaborationManager, EndpointInfo};
use crate::link::Hub;
use crate::message::{self, EndpointId, ErrorCode, MessageKind, StateMessage, Variant};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("chat message without text")]
    EmptyChat,
    #[error("field is reserved for the relay: {0}")]
    ReservedField(&'static str),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyChat => "E_EMPTY_CHAT",
            Self::ReservedField(_) => "E_RESERVED_FIELD",
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub collab: Arc<RwLock<CollaborationManager<Hub>>>,
    next_id: Arc<AtomicU32>,
    channel_capacity: usize,
}

impl AppState {
    #[must_use]
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            collab: Arc::new(RwLock::new(CollaborationManager::new(Hub::new()))),
            next_id: Arc::new(AtomicU32::new(1)),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn next_endpoint_id(&self) -> EndpointId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// =============================================================================
// ROUTES
// =============================================================================

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/session", get(handle_ws))
        .route("/users", get(list_users))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<EndpointInfo>> {
    Json(state.collab.read().await.endpoints())
}

async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let name = params.get("name").map(|n| n.trim().to_owned()).filter(|n| !n.is_empty());
    ws.on_upgrade(move |socket| run_ws(socket, state, name))
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Assign an id, attach an outbound queue, and join the session.
pub(crate) async fn register(state: &AppState, name: Option<String>) -> (EndpointId, mpsc::Receiver<StateMessage>) {
    let endpoint = state.next_endpoint_id();
    let name = name.unwrap_or_else(|| format!("user-{endpoint}"));
    let (tx, rx) = mpsc::channel(state.channel_capacity);

    let mut collab = state.collab.write().await;
    collab.link_mut().attach(endpoint, tx);
    collab.link().send_to(endpoint, &message::welcome(endpoint));
    collab.connect(endpoint, &name);
    info!(endpoint, %name, peers = collab.link().peer_count(), "relay: endpoint joined");
    (endpoint, rx)
}

pub(crate) async fn unregister(state: &AppState, endpoint: EndpointId) {
    let mut collab = state.collab.write().await;
    collab.link_mut().detach(endpoint);
    if let Err(e) = collab.disconnect(endpoint) {
        warn!(endpoint, error = %e, "relay: disconnect of unknown endpoint");
    }
    info!(endpoint, master = ?collab.master(), "relay: endpoint left");
}

async fn run_ws(mut socket: WebSocket, state: AppState, name: Option<String>) {
    let (endpoint, mut outbound) = register(&state, name).await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        let replies = process_inbound(&state, endpoint, &bytes).await;
                        if send_all(&mut socket, endpoint, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(msg) = outbound.recv() => {
                if send_message(&mut socket, endpoint, &msg).await.is_err() {
                    break;
                }
            }
        }
    }

    unregister(&state, endpoint).await;
}

async fn send_all(socket: &mut WebSocket, endpoint: EndpointId, msgs: &[StateMessage]) -> Result<(), ()> {
    for msg in msgs {
        send_message(socket, endpoint, msg).await?;
    }
    Ok(())
}

async fn send_message(socket: &mut WebSocket, endpoint: EndpointId, msg: &StateMessage) -> Result<(), ()> {
    if msg.has_field(message::ERROR_CODE) {
        let code = msg.value(message::ERROR_CODE).and_then(Variant::as_text).unwrap_or("-");
        warn!(endpoint, code, "relay: send error reply");
    }
    socket
        .send(Message::Binary(frames::encode_message(msg).into()))
        .await
        .map_err(|_| ())
}

// =============================================================================
// INBOUND
// =============================================================================

/// Handle one inbound frame from `sender`. Returns the replies for the
/// sender; peer traffic goes out through the hub.
pub(crate) async fn process_inbound(state: &AppState, sender: EndpointId, bytes: &[u8]) -> Vec<StateMessage> {
    let msg = match frames::decode_message(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(endpoint = sender, error = %e, "relay: invalid inbound frame");
            return vec![message::error_reply(&e)];
        }
    };
    debug!(endpoint = sender, kind = ?msg.kind(), target_id = msg.target_id(), "relay: recv");

    let mut collab = state.collab.write().await;
    match msg.kind() {
        MessageKind::Other if msg.has_field(message::USER_LIST) => match collab.merge_proposal(sender, &msg) {
            Ok(changed) => {
                debug!(endpoint = sender, changed, "relay: membership proposal merged");
                Vec::new()
            }
            Err(e) => {
                warn!(endpoint = sender, error = %e, "relay: membership proposal refused");
                vec![message::error_reply(&e), collab.membership_message()]
            }
        },
        MessageKind::Other if msg.has_field(message::WELCOME) => {
            warn!(endpoint = sender, "relay: client sent a welcome");
            vec![message::error_reply(&RelayError::ReservedField(message::WELCOME))]
        }
        MessageKind::Chat => {
            let Some(text) = msg.value(message::CHAT_TEXT).and_then(Variant::as_text) else {
                return vec![message::error_reply(&RelayError::EmptyChat)];
            };
            collab.link().relay_from(sender, &message::chat(sender, text));
            Vec::new()
        }
        MessageKind::UserData if !message::is_coupling(&msg) => {
            if let Err(e) = collab.require_master(sender) {
                warn!(endpoint = sender, target_id = msg.target_id(), error = %e, "relay: state from non-master refused");
                return vec![message::error_reply(&e)];
            }
            collab.link().relay_from(sender, &msg);
            Vec::new()
        }
        _ => {
            collab.link().relay_from(sender, &msg);
            Vec::new()
        }
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
