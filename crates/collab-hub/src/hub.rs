use crate::config::Config;
use crate::registry::{Delivery, Identity, Outbox, Registry};
use chrono::Utc;
use collab_core::protocol::{
    AuthenticatePayload, AuthenticatedPayload, ChatDelivery, ChatMessagePayload,
    CollaborationAckPayload, CollaborationPayload, ConnectedPayload, CursorUpdatePayload,
    ErrorPayload, ExecutionUpdatePayload, FileChangePayload, PresencePayload, ProjectUpdatePayload,
    ProjectUsersPayload, RoomPresencePayload, Stamped, StampedCollaboration, TypingPayload,
};
use collab_core::{ClientMessage, ServerMessage, SessionId, UserIdentity, UserSummary};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CONNECTED_MESSAGE: &str = "Connected to collaboration server";

/// Why the hub refused a client request. Sent back to the caller as an
/// `error` message; no state changes and nothing is relayed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("authenticate before sending {0}")]
    NotAuthenticated(&'static str),
    #[error("display name must not be empty")]
    InvalidName,
    #[error("project id must not be empty")]
    InvalidProjectId,
    #[error("not in a project room")]
    NotInRoom,
    #[error("unknown session")]
    UnknownSession,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("message exceeds max size: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::NotAuthenticated(_) => "not_authenticated",
            Rejection::InvalidName => "invalid_name",
            Rejection::InvalidProjectId => "invalid_project_id",
            Rejection::NotInRoom => "not_in_room",
            Rejection::UnknownSession => "unknown_session",
            Rejection::InvalidPayload(_) => "invalid_payload",
            Rejection::MessageTooLarge { .. } => "message_too_large",
        }
    }
}

/// Who receives a relayed message besides the hub's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope<'a> {
    /// Members of the room, minus the sender.
    Room(&'a str),
    /// Every connected session, minus the sender.
    Others,
    /// Every connected session, sender included.
    Everyone,
}

impl<'a> Scope<'a> {
    fn room_or_others(project_id: Option<&'a str>) -> Self {
        match project_id.filter(|value| !value.trim().is_empty()) {
            Some(project_id) => Scope::Room(project_id),
            None => Scope::Others,
        }
    }
}

pub struct Hub {
    config: Config,
    conn_counter: AtomicU64,
    registry: RwLock<Registry>,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn next_session_id(&self) -> SessionId {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        SessionId(format!("sess-{id}"))
    }

    pub async fn connect(&self, outbox: Outbox) -> SessionId {
        let session_id = self.next_session_id();
        let mut registry = self.registry.write().await;
        registry.insert_session(session_id.clone(), outbox);
        registry.send_to(
            &session_id,
            ServerMessage::Connected(ConnectedPayload {
                session_id: session_id.clone(),
                timestamp: Utc::now(),
                message: CONNECTED_MESSAGE.to_string(),
            }),
        );
        info!(
            event = "session_connected",
            session_id = %session_id,
            sessions = registry.session_count()
        );
        session_id
    }

    pub async fn disconnect(&self, session_id: &SessionId, reason: &str) {
        let mut registry = self.registry.write().await;
        close_session(&mut registry, session_id, reason);
    }

    /// Disconnects the session only if it is still silent once the write
    /// lock is held.
    pub async fn reap_if_stale(&self, session_id: &SessionId, stale_after: Duration) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.is_stale(session_id, stale_after) {
            return false;
        }
        warn!(event = "stale_close", session_id = %session_id);
        close_session(&mut registry, session_id, "stale");
        true
    }

    pub async fn touch(&self, session_id: &SessionId) {
        self.registry.write().await.touch(session_id);
    }

    pub async fn stale_sessions(&self, stale_after: Duration) -> Vec<SessionId> {
        self.registry.read().await.stale_sessions(stale_after)
    }

    #[cfg(test)]
    pub async fn roster(&self, project_id: &str) -> Vec<UserIdentity> {
        self.registry.read().await.roster(project_id)
    }

    #[cfg(test)]
    pub async fn has_room(&self, project_id: &str) -> bool {
        self.registry.read().await.has_room(project_id)
    }

    /// Runs one inbound message; a rejection is reported to the sender.
    pub async fn handle_message(&self, session_id: &SessionId, message: ClientMessage) {
        let kind = message.kind();
        if let Err(rejection) = self.dispatch(session_id, message).await {
            self.reject(session_id, kind, &rejection).await;
        }
    }

    pub async fn reject(&self, session_id: &SessionId, kind: &str, rejection: &Rejection) {
        warn!(
            event = "rejected",
            session_id = %session_id,
            message = kind,
            code = rejection.code()
        );
        self.registry.read().await.send_to(
            session_id,
            ServerMessage::Error(ErrorPayload {
                code: rejection.code().to_string(),
                message: rejection.to_string(),
            }),
        );
    }

    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        message: ClientMessage,
    ) -> Result<(), Rejection> {
        match message {
            ClientMessage::Authenticate(payload) => {
                self.authenticate(session_id, payload).await.map(|_| ())
            }
            ClientMessage::JoinProject(payload) => {
                self.join_room(session_id, &payload.project_id).await
            }
            ClientMessage::LeaveProject => self.leave_room(session_id).await,
            ClientMessage::GetProjectUsers(payload) => {
                self.get_room_members(session_id, &payload.project_id).await
            }
            ClientMessage::Collaboration(payload) => self
                .relay_collaboration(session_id, payload)
                .await
                .map(|_| ()),
            ClientMessage::ChatMessage(payload) => self.chat_message(session_id, payload).await,
            ClientMessage::Typing(payload) => self.typing_indicator(session_id, payload).await,
            ClientMessage::FileChange(payload) => self.file_change(session_id, payload).await,
            ClientMessage::CursorUpdate(payload) => self.cursor_update(session_id, payload).await,
            ClientMessage::SandboxExecution(payload) => {
                self.execution_update(session_id, payload, ServerMessage::SandboxExecution)
                    .await
            }
            ClientMessage::AgentExecution(payload) => {
                self.execution_update(session_id, payload, ServerMessage::AgentExecution)
                    .await
            }
            ClientMessage::WorkflowExecution(payload) => {
                self.execution_update(session_id, payload, ServerMessage::WorkflowExecution)
                    .await
            }
            ClientMessage::ProjectUpdate(payload) => {
                self.project_update(session_id, payload).await
            }
        }
    }

    pub async fn authenticate(
        &self,
        session_id: &SessionId,
        payload: AuthenticatePayload,
    ) -> Result<UserIdentity, Rejection> {
        let name = payload.name.trim();
        if name.is_empty() {
            return Err(Rejection::InvalidName);
        }
        let avatar = payload.avatar.filter(|value| !value.trim().is_empty());

        let mut registry = self.registry.write().await;
        let user = registry
            .set_identity(
                session_id,
                Identity {
                    name: name.to_string(),
                    avatar,
                },
            )
            .ok_or(Rejection::UnknownSession)?;

        registry.send_to(
            session_id,
            ServerMessage::Authenticated(AuthenticatedPayload {
                success: true,
                user: user.clone(),
            }),
        );
        registry.deliver_to_all(
            Some(session_id),
            &ServerMessage::UserJoined(PresencePayload {
                user: user.clone(),
                timestamp: Utc::now(),
            }),
        );
        info!(event = "session_authenticated", session_id = %session_id, name = %user.name);
        Ok(user)
    }

    pub async fn join_room(&self, session_id: &SessionId, project_id: &str) -> Result<(), Rejection> {
        if project_id.trim().is_empty() {
            return Err(Rejection::InvalidProjectId);
        }
        let mut registry = self.registry.write().await;
        require_identity(&registry, session_id, "join_project")?;

        let outcome = registry
            .join_room(session_id, project_id)
            .ok_or(Rejection::UnknownSession)?;

        if let Some(left) = outcome.left {
            notify_room_left(&registry, &left.project_id, left.user, Some(session_id));
            if left.room_removed {
                info!(event = "room_removed", project_id = %left.project_id);
            }
        }

        if !outcome.already_member {
            if let Some(user) = registry.session(session_id).and_then(|session| session.user()) {
                registry.deliver_to_room(
                    project_id,
                    Some(session_id),
                    &ServerMessage::UserJoinedProject(RoomPresencePayload {
                        user,
                        project_id: project_id.to_string(),
                        timestamp: Utc::now(),
                    }),
                );
            }
            info!(
                event = "room_joined",
                session_id = %session_id,
                project_id = %project_id,
                created = outcome.created,
                rooms = registry.room_count()
            );
        }

        let users = registry.roster(project_id);
        registry.send_to(
            session_id,
            ServerMessage::ProjectUsers(ProjectUsersPayload {
                project_id: project_id.to_string(),
                users,
            }),
        );
        Ok(())
    }

    pub async fn leave_room(&self, session_id: &SessionId) -> Result<(), Rejection> {
        let mut registry = self.registry.write().await;
        require_identity(&registry, session_id, "leave_project")?;
        let left = registry.leave_room(session_id).ok_or(Rejection::NotInRoom)?;
        notify_room_left(&registry, &left.project_id, left.user, Some(session_id));
        if left.room_removed {
            info!(event = "room_removed", project_id = %left.project_id);
        }
        Ok(())
    }

    /// Replies with the roster of any room; membership is not required.
    pub async fn get_room_members(
        &self,
        session_id: &SessionId,
        project_id: &str,
    ) -> Result<(), Rejection> {
        if project_id.trim().is_empty() {
            return Err(Rejection::InvalidProjectId);
        }
        let registry = self.registry.read().await;
        let users = registry.roster(project_id);
        registry.send_to(
            session_id,
            ServerMessage::ProjectUsers(ProjectUsersPayload {
                project_id: project_id.to_string(),
                users,
            }),
        );
        Ok(())
    }

    /// Relays a generic collaboration message and acks the sender. Returns
    /// the ack's message id.
    pub async fn relay_collaboration(
        &self,
        session_id: &SessionId,
        payload: CollaborationPayload,
    ) -> Result<String, Rejection> {
        let registry = self.registry.read().await;
        require_identity(&registry, session_id, "collaboration")?;

        let now = Utc::now();
        let scope_project = payload.project_id.clone();
        let scope = Scope::room_or_others(scope_project.as_deref());
        let category = payload.category;
        let stamped = ServerMessage::Collaboration(StampedCollaboration {
            message: payload,
            user_id: session_id.clone(),
            timestamp: now,
        });
        let delivered = deliver_scoped(&registry, scope, session_id, &stamped);

        let message_id = format!("{}_{}", session_id, now.timestamp_millis());
        registry.send_to(
            session_id,
            ServerMessage::CollaborationAck(CollaborationAckPayload {
                message_id: message_id.clone(),
                timestamp: now,
            }),
        );
        debug!(
            event = "relay",
            kind = "collaboration",
            category = %category,
            session_id = %session_id,
            delivered = delivered
        );
        Ok(message_id)
    }

    /// Chat is delivered to every session, sender included, whatever the
    /// project id says.
    pub async fn chat_message(
        &self,
        session_id: &SessionId,
        payload: ChatMessagePayload,
    ) -> Result<(), Rejection> {
        let registry = self.registry.read().await;
        let user = require_identity(&registry, session_id, "chat_message")?;
        let now = Utc::now();
        let message = ServerMessage::ChatMessage(ChatDelivery {
            id: chat_message_id(now.timestamp_millis()),
            chat_id: payload.chat_id,
            message: payload.message,
            user: UserSummary::from(&user),
            timestamp: now,
        });
        let delivered = deliver_scoped(&registry, Scope::Everyone, session_id, &message);
        debug!(event = "relay", kind = "chat_message", session_id = %session_id, delivered = delivered);
        Ok(())
    }

    pub async fn typing_indicator(
        &self,
        session_id: &SessionId,
        payload: TypingPayload,
    ) -> Result<(), Rejection> {
        let scope_project = payload.project_id.clone();
        self.relay_stamped(
            session_id,
            "typing",
            Scope::room_or_others(scope_project.as_deref()),
            payload,
            ServerMessage::Typing,
        )
        .await
    }

    pub async fn file_change(
        &self,
        session_id: &SessionId,
        payload: FileChangePayload,
    ) -> Result<(), Rejection> {
        let scope_project = payload.project_id.clone();
        self.relay_stamped(
            session_id,
            "file_change",
            Scope::room_or_others(scope_project.as_deref()),
            payload,
            ServerMessage::FileChange,
        )
        .await
    }

    pub async fn cursor_update(
        &self,
        session_id: &SessionId,
        payload: CursorUpdatePayload,
    ) -> Result<(), Rejection> {
        let scope_project = payload.project_id.clone();
        self.relay_stamped(
            session_id,
            "cursor_update",
            Scope::room_or_others(scope_project.as_deref()),
            payload,
            ServerMessage::CursorUpdate,
        )
        .await
    }

    pub async fn project_update(
        &self,
        session_id: &SessionId,
        payload: ProjectUpdatePayload,
    ) -> Result<(), Rejection> {
        let scope_project = payload.project_id.clone();
        self.relay_stamped(
            session_id,
            "project_update",
            Scope::room_or_others(scope_project.as_deref()),
            payload,
            ServerMessage::ProjectUpdate,
        )
        .await
    }

    /// Sandbox, agent and workflow status updates always go to everyone.
    pub async fn execution_update(
        &self,
        session_id: &SessionId,
        payload: ExecutionUpdatePayload,
        wrap: fn(Stamped<ExecutionUpdatePayload>) -> ServerMessage,
    ) -> Result<(), Rejection> {
        self.relay_stamped(session_id, "execution", Scope::Everyone, payload, wrap)
            .await
    }

    async fn relay_stamped<T>(
        &self,
        session_id: &SessionId,
        kind: &'static str,
        scope: Scope<'_>,
        payload: T,
        wrap: fn(Stamped<T>) -> ServerMessage,
    ) -> Result<(), Rejection> {
        let registry = self.registry.read().await;
        let user = require_identity(&registry, session_id, kind)?;
        let message = wrap(Stamped {
            payload,
            user: UserSummary::from(&user),
            timestamp: Utc::now(),
        });
        let delivered = deliver_scoped(&registry, scope, session_id, &message);
        debug!(
            event = "relay",
            kind = message.kind(),
            session_id = %session_id,
            scope = ?scope,
            delivered = delivered
        );
        Ok(())
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        let Some(stale_after) = self.config.stale_after else {
            return;
        };
        let interval = (stale_after / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.reap_stale(stale_after).await;
            }
        });
    }

    /// Disconnects every session silent for longer than `stale_after`.
    pub async fn reap_stale(&self, stale_after: Duration) -> usize {
        let mut reaped = 0;
        for session_id in self.stale_sessions(stale_after).await {
            if self.reap_if_stale(&session_id, stale_after).await {
                reaped += 1;
            }
        }
        reaped
    }

    #[cfg(test)]
    pub async fn assert_consistent(&self) {
        self.registry.read().await.assert_consistent();
    }
}

fn close_session(registry: &mut Registry, session_id: &SessionId, reason: &str) {
    let Some((session, left)) = registry.remove_session(session_id) else {
        return;
    };
    if let Some(left) = left {
        notify_room_left(registry, &left.project_id, left.user, None);
        if left.room_removed {
            info!(event = "room_removed", project_id = %left.project_id);
        }
    }
    if let Some(user) = session.user() {
        registry.deliver_to_all(
            None,
            &ServerMessage::UserLeft(PresencePayload {
                user,
                timestamp: Utc::now(),
            }),
        );
    }
    info!(
        event = "session_disconnected",
        session_id = %session_id,
        reason = reason,
        sessions = registry.session_count(),
        rooms = registry.room_count()
    );
}

fn require_identity(
    registry: &Registry,
    session_id: &SessionId,
    kind: &'static str,
) -> Result<UserIdentity, Rejection> {
    let session = registry
        .session(session_id)
        .ok_or(Rejection::UnknownSession)?;
    session.user().ok_or(Rejection::NotAuthenticated(kind))
}

fn notify_room_left(
    registry: &Registry,
    project_id: &str,
    user: Option<UserIdentity>,
    leaving: Option<&SessionId>,
) {
    let Some(user) = user else {
        return;
    };
    info!(event = "room_left", session_id = %user.id, project_id = %project_id);
    registry.deliver_to_room(
        project_id,
        leaving,
        &ServerMessage::UserLeftProject(RoomPresencePayload {
            user,
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
        }),
    );
}

fn deliver_scoped(
    registry: &Registry,
    scope: Scope<'_>,
    sender: &SessionId,
    message: &ServerMessage,
) -> usize {
    match scope {
        Scope::Room(project_id) => registry.deliver_to_room(project_id, Some(sender), message),
        Scope::Others => registry.deliver_to_all(Some(sender), message),
        Scope::Everyone => registry.deliver_to_all(None, message),
    }
}

fn chat_message_id(millis: i64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{millis}_{}", &suffix[..6])
}
