/// WebSocket event channel
///
/// Frames are JSON text. A request `{"id", "event", "data"}` is answered
/// with `{"id", "status", "data"}` where `data` is the JSON encoded payload.
/// Events of one connection run one at a time, in arrival order.
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::session::{ConnectionId, TransportContext};
use crate::dispatch::{Dispatcher, Operation, Reply};
use crate::error::GatewayError;
use crate::transport::AppState;

#[derive(Debug, Serialize)]
struct ReplyFrame {
    id: Value,
    status: u16,
    data: String,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let ctx = TransportContext::socket(connection_id.clone());
    info!("Socket client connected: {}", connection_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    while let Some(message) = ws_rx.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => handle_frame(&state.dispatcher, &ctx, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                let err = GatewayError::bad_request("binary frames are not supported");
                encode_reply(Value::Null, &Reply::error(&err))
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Socket {} receive error: {}", connection_id, e);
                break;
            }
        };

        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }

    state.dispatcher.broker().on_disconnect(&connection_id).await;
    info!("Socket client disconnected: {}", connection_id);
}

/// Run one request frame and return the encoded reply frame
pub async fn handle_frame(dispatcher: &Dispatcher, ctx: &TransportContext, text: &str) -> String {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame @ Value::Object(_)) => frame,
        Ok(_) => return malformed(Value::Null, "frame must be a JSON object"),
        Err(e) => return malformed(Value::Null, &format!("invalid JSON frame: {e}")),
    };

    let id = frame.get("id").cloned().unwrap_or(Value::Null);
    let Some(event) = frame.get("event").and_then(Value::as_str) else {
        return malformed(id, "frame is missing 'event'");
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let reply = match Operation::from_event(event, data) {
        Ok(op) => dispatcher.dispatch(ctx, op).await,
        Err(e) => Reply::error(&e),
    };
    encode_reply(id, &reply)
}

fn malformed(id: Value, message: &str) -> String {
    encode_reply(id, &Reply::error(&GatewayError::bad_request(message)))
}

fn encode_reply(id: Value, reply: &Reply) -> String {
    let frame = ReplyFrame {
        id,
        status: reply.status,
        data: reply.payload.to_string(),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}
