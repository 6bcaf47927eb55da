//! Best-effort WebSocket fan-out of captured tool output.
//!
//! Every line the runner captures is broadcast to whoever is connected to
//! `/ws/log-stream`. Delivery is fire-and-forget: a listener that lags far
//! enough to drop lines just misses them, and a disconnected socket ends its
//! forwarding task silently.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::broadcast;

use crate::runner::LogLine;

use super::AppState;

pub(super) async fn ws_log_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.log_tx.subscribe();
    ws.on_upgrade(move |socket| forward_log_lines(socket, rx))
}

async fn forward_log_lines(mut socket: WebSocket, mut rx: broadcast::Receiver<LogLine>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                let Ok(payload) = serde_json::to_string(&line) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    // Listener went away; drop it without ceremony.
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "log-stream listener lagged, lines dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::runner::{LogLine, StreamKind};

    #[test]
    fn test_log_line_wire_shape() {
        let line = LogLine {
            job_id: Uuid::nil(),
            stream: StreamKind::Stderr,
            line: "node crashed".to_string(),
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["line"], "node crashed");
        assert_eq!(json["job_id"], "00000000-0000-0000-0000-000000000000");
    }
}
