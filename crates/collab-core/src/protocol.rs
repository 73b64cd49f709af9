use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity a session takes on after `authenticate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: SessionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_project: Option<String>,
}

/// Sender attribution stamped onto relayed payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: SessionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl From<&UserIdentity> for UserSummary {
    fn from(user: &UserIdentity) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollabCategory {
    Chat,
    File,
    #[serde(alias = "sandbox_execution", alias = "sandbox-execution")]
    Sandbox,
    #[serde(alias = "agent_execution", alias = "agent-execution")]
    Agent,
    #[serde(alias = "workflow_execution", alias = "workflow-execution")]
    Workflow,
    #[serde(alias = "project_update", alias = "project-update")]
    Project,
    User,
}

impl CollabCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollabCategory::Chat => "chat",
            CollabCategory::File => "file",
            CollabCategory::Sandbox => "sandbox",
            CollabCategory::Agent => "agent",
            CollabCategory::Workflow => "workflow",
            CollabCategory::Project => "project",
            CollabCategory::User => "user",
        }
    }
}

impl fmt::Display for CollabCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollabCategory {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "chat" => Ok(CollabCategory::Chat),
            "file" => Ok(CollabCategory::File),
            "sandbox" | "sandbox_execution" | "sandbox-execution" => Ok(CollabCategory::Sandbox),
            "agent" | "agent_execution" | "agent-execution" => Ok(CollabCategory::Agent),
            "workflow" | "workflow_execution" | "workflow-execution" => {
                Ok(CollabCategory::Workflow)
            }
            "project" | "project_update" | "project-update" => Ok(CollabCategory::Project),
            "user" => Ok(CollabCategory::User),
            other => Err(format!("Unknown category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollabAction {
    Create,
    Update,
    Delete,
    Execute,
    Join,
    Leave,
}

impl CollabAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollabAction::Create => "create",
            CollabAction::Update => "update",
            CollabAction::Delete => "delete",
            CollabAction::Execute => "execute",
            CollabAction::Join => "join",
            CollabAction::Leave => "leave",
        }
    }
}

impl fmt::Display for CollabAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollabAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "create" => Ok(CollabAction::Create),
            "update" => Ok(CollabAction::Update),
            "delete" => Ok(CollabAction::Delete),
            "execute" => Ok(CollabAction::Execute),
            "join" => Ok(CollabAction::Join),
            "leave" => Ok(CollabAction::Leave),
            other => Err(format!("Unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatePayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRef {
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaborationPayload {
    #[serde(rename = "type")]
    pub category: CollabCategory,
    pub action: CollabAction,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessagePayload {
    pub chat_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    pub chat_id: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChangePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub file_path: String,
    #[serde(default)]
    pub content: String,
    pub action: FileAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorUpdatePayload {
    pub file_id: String,
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Status report for a sandbox, agent or workflow run. `id` names the run's
/// subject (sandbox id, agent id or workflow id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionUpdatePayload {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate(AuthenticatePayload),
    JoinProject(ProjectRef),
    LeaveProject,
    GetProjectUsers(ProjectRef),
    Collaboration(CollaborationPayload),
    ChatMessage(ChatMessagePayload),
    Typing(TypingPayload),
    FileChange(FileChangePayload),
    CursorUpdate(CursorUpdatePayload),
    SandboxExecution(ExecutionUpdatePayload),
    AgentExecution(ExecutionUpdatePayload),
    WorkflowExecution(ExecutionUpdatePayload),
    ProjectUpdate(ProjectUpdatePayload),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate(_) => "authenticate",
            ClientMessage::JoinProject(_) => "join_project",
            ClientMessage::LeaveProject => "leave_project",
            ClientMessage::GetProjectUsers(_) => "get_project_users",
            ClientMessage::Collaboration(_) => "collaboration",
            ClientMessage::ChatMessage(_) => "chat_message",
            ClientMessage::Typing(_) => "typing",
            ClientMessage::FileChange(_) => "file_change",
            ClientMessage::CursorUpdate(_) => "cursor_update",
            ClientMessage::SandboxExecution(_) => "sandbox_execution",
            ClientMessage::AgentExecution(_) => "agent_execution",
            ClientMessage::WorkflowExecution(_) => "workflow_execution",
            ClientMessage::ProjectUpdate(_) => "project_update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedPayload {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedPayload {
    pub success: bool,
    pub user: UserIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresencePayload {
    pub user: UserIdentity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPresencePayload {
    pub user: UserIdentity,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectUsersPayload {
    pub project_id: String,
    #[serde(default)]
    pub users: Vec<UserIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StampedCollaboration {
    #[serde(flatten)]
    pub message: CollaborationPayload,
    pub user_id: SessionId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollaborationAckPayload {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatDelivery {
    pub id: String,
    pub chat_id: String,
    pub message: String,
    pub user: UserSummary,
    pub timestamp: DateTime<Utc>,
}

/// A client payload as delivered to recipients: the payload fields plus the
/// sender and the hub's receive time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stamped<T> {
    #[serde(flatten)]
    pub payload: T,
    pub user: UserSummary,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected(ConnectedPayload),
    Authenticated(AuthenticatedPayload),
    UserJoined(PresencePayload),
    UserLeft(PresencePayload),
    UserJoinedProject(RoomPresencePayload),
    UserLeftProject(RoomPresencePayload),
    ProjectUsers(ProjectUsersPayload),
    Collaboration(StampedCollaboration),
    CollaborationAck(CollaborationAckPayload),
    ChatMessage(ChatDelivery),
    Typing(Stamped<TypingPayload>),
    FileChange(Stamped<FileChangePayload>),
    CursorUpdate(Stamped<CursorUpdatePayload>),
    SandboxExecution(Stamped<ExecutionUpdatePayload>),
    AgentExecution(Stamped<ExecutionUpdatePayload>),
    WorkflowExecution(Stamped<ExecutionUpdatePayload>),
    ProjectUpdate(Stamped<ProjectUpdatePayload>),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected(_) => "connected",
            ServerMessage::Authenticated(_) => "authenticated",
            ServerMessage::UserJoined(_) => "user_joined",
            ServerMessage::UserLeft(_) => "user_left",
            ServerMessage::UserJoinedProject(_) => "user_joined_project",
            ServerMessage::UserLeftProject(_) => "user_left_project",
            ServerMessage::ProjectUsers(_) => "project_users",
            ServerMessage::Collaboration(_) => "collaboration",
            ServerMessage::CollaborationAck(_) => "collaboration_ack",
            ServerMessage::ChatMessage(_) => "chat_message",
            ServerMessage::Typing(_) => "typing",
            ServerMessage::FileChange(_) => "file_change",
            ServerMessage::CursorUpdate(_) => "cursor_update",
            ServerMessage::SandboxExecution(_) => "sandbox_execution",
            ServerMessage::AgentExecution(_) => "agent_execution",
            ServerMessage::WorkflowExecution(_) => "workflow_execution",
            ServerMessage::ProjectUpdate(_) => "project_update",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
