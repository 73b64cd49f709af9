use crate::hub::{Hub, Rejection};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use collab_core::{decode_frame, encode_frame, ClientMessage, FrameError, ServerMessage, SessionId};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

impl Hub {
    /// Owns one connection: registers the session, pumps inbound frames
    /// through the hub in order, and cleans up when either side goes away.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let config = self.config().clone();
        let (tx, rx) = mpsc::channel::<ServerMessage>(config.queue_capacity);
        let session_id = self.connect(tx).await;
        info!(event = "socket_open", session_id = %session_id, remote = %remote);

        let mut write_task = tokio::spawn(writer_loop(
            session_id.clone(),
            ws_sender,
            rx,
            WriterSettings {
                ping_interval: config.ping_interval,
                write_timeout: config.write_timeout,
                max_frame_bytes: config.max_frame_bytes,
            },
        ));
        let mut writer_done = false;

        let reason = loop {
            tokio::select! {
                _ = &mut write_task => {
                    writer_done = true;
                    break "writer_closed";
                }
                next = ws_receiver.next() => {
                    let msg = match next {
                        Some(Ok(value)) => value,
                        Some(Err(err)) => {
                            warn!(event = "read_error", session_id = %session_id, error = %err);
                            break "read_error";
                        }
                        None => break "disconnect",
                    };
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(bytes) => bytes,
                        Message::Close(_) => {
                            info!(event = "client_close", session_id = %session_id);
                            break "client_close";
                        }
                        Message::Ping(_) | Message::Pong(_) => {
                            self.touch(&session_id).await;
                            continue;
                        }
                    };
                    self.touch(&session_id).await;
                    self.handle_frame(&session_id, &data).await;
                }
            }
        };

        self.disconnect(&session_id, reason).await;
        if !writer_done {
            let _ = write_task.await;
        }
    }

    async fn handle_frame(&self, session_id: &SessionId, data: &[u8]) {
        let message = match decode_frame::<ClientMessage>(data, self.config().max_frame_bytes) {
            Ok(value) => value,
            Err(FrameError::OversizedFrame { size, max }) => {
                self.reject(session_id, "frame", &Rejection::MessageTooLarge { size, max })
                    .await;
                return;
            }
            Err(err) => {
                self.reject(
                    session_id,
                    "frame",
                    &Rejection::InvalidPayload(err.to_string()),
                )
                .await;
                return;
            }
        };
        if self.config().debug {
            debug!(
                event = "message_received",
                session_id = %session_id,
                kind = message.kind(),
                raw = %String::from_utf8_lossy(data)
            );
        }
        self.handle_message(session_id, message).await;
    }
}

struct WriterSettings {
    ping_interval: Duration,
    write_timeout: Duration,
    max_frame_bytes: usize,
}

/// Drains a session's outbox into the socket and sends keepalive pings.
/// Returns once the outbox closes or a write fails or times out.
async fn writer_loop(
    session_id: SessionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
    settings: WriterSettings,
) {
    let mut ticker = (!settings.ping_interval.is_zero()).then(|| {
        tokio::time::interval_at(
            tokio::time::Instant::now() + settings.ping_interval,
            settings.ping_interval,
        )
    });

    loop {
        let outgoing = tokio::select! {
            next = rx.recv() => match next {
                Some(message) => match encode_frame(&message, settings.max_frame_bytes) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(event = "encode_error", session_id = %session_id, error = %err);
                        continue;
                    }
                },
                None => {
                    let _ = tokio::time::timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = next_tick(&mut ticker) => Message::Ping(Vec::new()),
        };

        match tokio::time::timeout(settings.write_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", session_id = %session_id, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "write_timeout", session_id = %session_id);
                return;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
