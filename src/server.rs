use crate::explorer::ExplorerService;
use crate::poller::TelemetryService;
use crate::stream::{StreamEvent, StreamMultiplexer};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

// Frames a viewer may lag behind before the multiplexer starts dropping for it.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub telemetry: TelemetryService,
    pub stream: Arc<StreamMultiplexer>,
    pub explorer: Option<ExplorerService>,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/telemetry", get(get_telemetry))
        .route("/api/telemetry/poll", post(trigger_poll))
        .route("/api/network", get(get_network))
        .route("/api/stream/logs", get(logs_ws))
        .with_state(state)
}

async fn get_telemetry(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.telemetry.overview())
}

async fn trigger_poll(State(state): State<AppState>) -> StatusCode {
    state.telemetry.request_poll();
    StatusCode::ACCEPTED
}

async fn get_network(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.explorer.as_ref().and_then(ExplorerService::latest))
}

async fn logs_ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    if !state.stream.configured() {
        return AppError::unavailable("no miner host configured").into_response();
    }
    let mux = state.stream.clone();
    upgrade.on_upgrade(move |socket| serve_subscriber(socket, mux))
}

/// Bridges one viewer websocket to the multiplexer. The viewer's own frames
/// are ignored (the stream is one-way); its disconnect is the detach path.
async fn serve_subscriber(mut socket: WebSocket, mux: Arc<StreamMultiplexer>) {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(SUBSCRIBER_QUEUE);
    let id = match mux.attach(tx) {
        Ok(id) => id,
        Err(err) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };
    tracing::debug!(subscriber = id, "log stream viewer attached");

    bridge(socket, rx).await;

    // No-op when the multiplexer already cleared the registry on upstream loss.
    mux.detach(id);
    tracing::debug!(subscriber = id, "log stream viewer detached");
}

/// Forwards multiplexer events to one viewer socket until either side ends.
/// The viewer always gets a close frame with a reason, even when the close
/// notice itself was lost and the channel just hung up.
async fn bridge<S>(mut socket: S, mut rx: mpsc::Receiver<StreamEvent>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StreamEvent::Frame(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(StreamEvent::Closed { reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: "log stream ended".into(),
                        })))
                        .await;
                    break;
                }
            },
            incoming = socket.next() => match incoming {
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}
