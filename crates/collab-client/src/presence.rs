use collab_core::protocol::ProjectUsersPayload;
use collab_core::{ServerMessage, SessionId, UserIdentity};

/// Local view of who is online, folded from server messages.
#[derive(Debug, Default, Clone)]
pub struct Presence {
    session_id: Option<SessionId>,
    user: Option<UserIdentity>,
    active_users: Vec<UserIdentity>,
    project_users: Option<ProjectUsersPayload>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Users announced since this client connected, minus those who left.
    pub fn active_users(&self) -> &[UserIdentity] {
        &self.active_users
    }

    pub fn project_users(&self) -> Option<&ProjectUsersPayload> {
        self.project_users.as_ref()
    }

    /// Forgets the local roster; call alongside `leave_project`.
    pub fn leave_project(&mut self) {
        self.project_users = None;
    }

    /// Folds one server message into local state. Returns whether anything
    /// changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Connected(payload) => {
                self.session_id = Some(payload.session_id.clone());
                true
            }
            ServerMessage::Authenticated(payload) => {
                if !payload.success {
                    return false;
                }
                self.user = Some(payload.user.clone());
                true
            }
            ServerMessage::UserJoined(payload) => upsert(&mut self.active_users, &payload.user),
            ServerMessage::UserLeft(payload) => {
                let mut changed = remove(&mut self.active_users, &payload.user.id);
                if let Some(roster) = self.project_users.as_mut() {
                    changed |= remove(&mut roster.users, &payload.user.id);
                }
                changed
            }
            ServerMessage::UserJoinedProject(payload) => match self.project_users.as_mut() {
                Some(roster) if roster.project_id == payload.project_id => {
                    upsert(&mut roster.users, &payload.user)
                }
                _ => false,
            },
            ServerMessage::UserLeftProject(payload) => match self.project_users.as_mut() {
                Some(roster) if roster.project_id == payload.project_id => {
                    remove(&mut roster.users, &payload.user.id)
                }
                _ => false,
            },
            ServerMessage::ProjectUsers(payload) => {
                self.project_users = Some(payload.clone());
                true
            }
            _ => false,
        }
    }
}

fn upsert(users: &mut Vec<UserIdentity>, user: &UserIdentity) -> bool {
    match users.iter_mut().find(|existing| existing.id == user.id) {
        Some(existing) if existing == user => false,
        Some(existing) => {
            *existing = user.clone();
            true
        }
        None => {
            users.push(user.clone());
            true
        }
    }
}

fn remove(users: &mut Vec<UserIdentity>, id: &SessionId) -> bool {
    let before = users.len();
    users.retain(|user| &user.id != id);
    users.len() != before
}
