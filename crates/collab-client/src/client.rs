use collab_core::protocol::{
    AuthenticatePayload, ChatMessagePayload, CollaborationPayload, CursorUpdatePayload,
    ExecutionUpdatePayload, FileChangePayload, ProjectRef, ProjectUpdatePayload, TypingPayload,
};
use collab_core::{
    decode_frame, encode_frame, ClientMessage, FrameError, ServerMessage, DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed")]
    Closed,
}

/// Handle to one hub connection. A background task owns the socket; inbound
/// messages arrive on the receiver returned by [`CollabClient::connect`],
/// which closes when the connection ends.
pub struct CollabClient {
    outbound: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl CollabClient {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ServerMessage>), ClientError> {
        let url = Url::parse(url).map_err(|err| ClientError::Connect(err.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Connect(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Connect(err.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let task = tokio::spawn(socket_loop(ws, out_rx, in_tx));
        Ok((
            Self {
                outbound: out_tx,
                task,
            },
            in_rx,
        ))
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let frame = encode_frame(message, DEFAULT_MAX_FRAME_BYTES)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn authenticate(&self, name: &str, avatar: Option<&str>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Authenticate(AuthenticatePayload {
            name: name.to_string(),
            avatar: avatar.map(str::to_string),
        }))
        .await
    }

    pub async fn join_project(&self, project_id: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::JoinProject(ProjectRef {
            project_id: project_id.to_string(),
        }))
        .await
    }

    pub async fn leave_project(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::LeaveProject).await
    }

    pub async fn get_project_users(&self, project_id: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::GetProjectUsers(ProjectRef {
            project_id: project_id.to_string(),
        }))
        .await
    }

    pub async fn send_collaboration(&self, payload: CollaborationPayload) -> Result<(), ClientError> {
        self.send(&ClientMessage::Collaboration(payload)).await
    }

    pub async fn send_chat_message(
        &self,
        chat_id: &str,
        message: &str,
        project_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::ChatMessage(ChatMessagePayload {
            chat_id: chat_id.to_string(),
            message: message.to_string(),
            project_id: project_id.map(str::to_string),
        }))
        .await
    }

    pub async fn send_typing(
        &self,
        chat_id: &str,
        is_typing: bool,
        project_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Typing(TypingPayload {
            chat_id: chat_id.to_string(),
            is_typing,
            project_id: project_id.map(str::to_string),
        }))
        .await
    }

    pub async fn send_file_change(&self, payload: FileChangePayload) -> Result<(), ClientError> {
        self.send(&ClientMessage::FileChange(payload)).await
    }

    pub async fn send_cursor_update(&self, payload: CursorUpdatePayload) -> Result<(), ClientError> {
        self.send(&ClientMessage::CursorUpdate(payload)).await
    }

    pub async fn send_sandbox_execution(
        &self,
        payload: ExecutionUpdatePayload,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::SandboxExecution(payload)).await
    }

    pub async fn send_agent_execution(
        &self,
        payload: ExecutionUpdatePayload,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::AgentExecution(payload)).await
    }

    pub async fn send_workflow_execution(
        &self,
        payload: ExecutionUpdatePayload,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::WorkflowExecution(payload)).await
    }

    pub async fn send_project_update(
        &self,
        payload: ProjectUpdatePayload,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::ProjectUpdate(payload)).await
    }

    /// Closes the socket and waits for the background task to finish.
    pub async fn close(self) {
        drop(self.outbound);
        let _ = self.task.await;
    }
}

async fn socket_loop(
    mut ws: HubSocket,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<ServerMessage>,
) {
    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match decode_frame::<ServerMessage>(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
                        Ok(message) => {
                            if inbound.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(event = "client_decode_error", error = %err),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "client_read_error", error = %err);
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(frame) => {
                    if let Err(err) = ws.send(Message::Text(frame)).await {
                        warn!(event = "client_write_error", error = %err);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = ws.close(None).await;
    debug!(event = "client_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use collab_core::protocol::{AuthenticatedPayload, ConnectedPayload};
    use collab_core::{SessionId, UserIdentity};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let result = CollabClient::connect("http://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        let result = CollabClient::connect("not a url").await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_typed_frames_and_surfaces_server_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            let connected = ServerMessage::Connected(ConnectedPayload {
                session_id: SessionId::from("sess-1"),
                timestamp: Utc::now(),
                message: "hello".to_string(),
            });
            let frame = encode_frame(&connected, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            ws.send(Message::Text(frame)).await.expect("send connected");

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected text frame")
            };
            let request: ClientMessage =
                decode_frame(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
            let ClientMessage::Authenticate(payload) = request else {
                panic!("expected authenticate, got {request:?}")
            };
            let reply = ServerMessage::Authenticated(AuthenticatedPayload {
                success: true,
                user: UserIdentity {
                    id: SessionId::from("sess-1"),
                    name: payload.name,
                    avatar: payload.avatar,
                    current_project: None,
                },
            });
            let frame = encode_frame(&reply, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            ws.send(Message::Text(frame)).await.expect("send reply");

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected text frame")
            };
            decode_frame::<ClientMessage>(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES)
                .expect("decode")
        });

        let (client, mut events) = CollabClient::connect(&format!("ws://{addr}"))
            .await
            .expect("connect");

        let first = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timeout")
            .expect("event");
        assert_eq!(first.kind(), "connected");

        client
            .authenticate("Alice", Some("avatar.png"))
            .await
            .expect("authenticate");
        let second = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timeout")
            .expect("event");
        let ServerMessage::Authenticated(payload) = second else {
            panic!("expected authenticated")
        };
        assert_eq!(payload.user.name, "Alice");
        assert_eq!(payload.user.avatar.as_deref(), Some("avatar.png"));

        client.leave_project().await.expect("leave");
        let last = server.await.expect("server task");
        assert_eq!(last, ClientMessage::LeaveProject);

        client.close().await;
        let closed = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timeout");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn oversized_messages_fail_before_sending() {
        let (outbound, _rx) = mpsc::channel(1);
        let client = CollabClient {
            outbound,
            task: tokio::spawn(async {}),
        };
        let huge = "x".repeat(DEFAULT_MAX_FRAME_BYTES + 1);
        let result = client.send_chat_message("chat-1", &huge, None).await;
        assert!(matches!(
            result,
            Err(ClientError::Frame(FrameError::OversizedFrame { .. }))
        ));
    }
}
