use collab_core::{ServerMessage, SessionId, UserIdentity};
use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Outbox = mpsc::Sender<ServerMessage>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub avatar: Option<String>,
}

pub struct Session {
    pub id: SessionId,
    pub identity: Option<Identity>,
    pub current_room: Option<String>,
    last_seen: Instant,
    outbox: Outbox,
}

impl Session {
    fn new(id: SessionId, outbox: Outbox) -> Self {
        Self {
            id,
            identity: None,
            current_room: None,
            last_seen: Instant::now(),
            outbox,
        }
    }

    /// Identity as seen by other clients; `None` until authenticated.
    pub fn user(&self) -> Option<UserIdentity> {
        self.identity.as_ref().map(|identity| UserIdentity {
            id: self.id.clone(),
            name: identity.name.clone(),
            avatar: identity.avatar.clone(),
            current_project: self.current_room.clone(),
        })
    }
}

#[derive(Default)]
struct Room {
    members: BTreeSet<SessionId>,
}

/// Result of removing a session from its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub project_id: String,
    /// Identity snapshot taken while the session was still a member.
    pub user: Option<UserIdentity>,
    pub room_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub left: Option<LeaveOutcome>,
    pub created: bool,
    pub already_member: bool,
}

/// Session and room registries. Every method leaves both maps consistent:
/// rooms are never empty and `current_room` always points at a room that
/// lists the session.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    pub fn insert_session(&mut self, id: SessionId, outbox: Outbox) {
        self.sessions
            .insert(id.clone(), Session::new(id, outbox));
    }

    /// Drops the session, leaving its room first.
    pub fn remove_session(&mut self, id: &SessionId) -> Option<(Session, Option<LeaveOutcome>)> {
        let left = self.leave_room(id);
        let session = self.sessions.remove(id)?;
        Some((session, left))
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn touch(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.last_seen = Instant::now();
        }
    }

    pub fn stale_sessions(&self, stale_after: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let mut stale = self
            .sessions
            .values()
            .filter(|session| now.duration_since(session.last_seen) > stale_after)
            .map(|session| session.id.clone())
            .collect::<Vec<_>>();
        stale.sort();
        stale
    }

    /// False for unknown sessions.
    pub fn is_stale(&self, id: &SessionId, stale_after: Duration) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|session| session.last_seen.elapsed() > stale_after)
    }

    pub fn set_identity(&mut self, id: &SessionId, identity: Identity) -> Option<UserIdentity> {
        let session = self.sessions.get_mut(id)?;
        session.identity = Some(identity);
        session.user()
    }

    pub fn join_room(&mut self, id: &SessionId, project_id: &str) -> Option<JoinOutcome> {
        let current = self.sessions.get(id)?.current_room.clone();
        if current.as_deref() == Some(project_id) {
            return Some(JoinOutcome {
                left: None,
                created: false,
                already_member: true,
            });
        }

        let left = self.leave_room(id);
        let created = !self.rooms.contains_key(project_id);
        self.rooms
            .entry(project_id.to_string())
            .or_default()
            .members
            .insert(id.clone());
        if let Some(session) = self.sessions.get_mut(id) {
            session.current_room = Some(project_id.to_string());
        }
        Some(JoinOutcome {
            left,
            created,
            already_member: false,
        })
    }

    pub fn leave_room(&mut self, id: &SessionId) -> Option<LeaveOutcome> {
        let session = self.sessions.get_mut(id)?;
        let user = session.user();
        let project_id = session.current_room.take()?;

        let mut room_removed = false;
        match self.rooms.get_mut(&project_id) {
            Some(room) => {
                room.members.remove(id);
                if room.members.is_empty() {
                    self.rooms.remove(&project_id);
                    room_removed = true;
                }
            }
            None => {
                warn!(event = "room_missing", session_id = %id, project_id = %project_id);
            }
        }
        Some(LeaveOutcome {
            project_id,
            user,
            room_removed,
        })
    }

    #[cfg(test)]
    pub fn room_members(&self, project_id: &str) -> Vec<SessionId> {
        self.rooms
            .get(project_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Identities of a room's members, ordered by session id.
    pub fn roster(&self, project_id: &str) -> Vec<UserIdentity> {
        let Some(room) = self.rooms.get(project_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter_map(Session::user)
            .collect()
    }

    #[cfg(test)]
    pub fn has_room(&self, project_id: &str) -> bool {
        self.rooms.contains_key(project_id)
    }

    fn push(&self, session: &Session, message: ServerMessage) -> bool {
        match session.outbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    event = "slow_consumer",
                    session_id = %session.id,
                    dropped = message.kind()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "outbox_closed", session_id = %session.id);
                false
            }
        }
    }

    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (project_id, room) in &self.rooms {
            assert!(!room.members.is_empty(), "room {project_id} is empty");
            for member in &room.members {
                let session = self
                    .sessions
                    .get(member)
                    .unwrap_or_else(|| panic!("room {project_id} lists missing {member}"));
                assert_eq!(session.current_room.as_deref(), Some(project_id.as_str()));
            }
        }
        for session in self.sessions.values() {
            if let Some(project_id) = &session.current_room {
                let room = self
                    .rooms
                    .get(project_id)
                    .unwrap_or_else(|| panic!("{} points at missing room", session.id));
                assert!(room.members.contains(&session.id));
            }
        }
    }
}

/// Fan-out seam between hub operations and session outboxes. Every method
/// returns how many recipients accepted the message.
pub trait Delivery {
    fn send_to(&self, session_id: &SessionId, message: ServerMessage) -> bool;

    fn deliver_to_room(
        &self,
        project_id: &str,
        exclude: Option<&SessionId>,
        message: &ServerMessage,
    ) -> usize;

    fn deliver_to_all(&self, exclude: Option<&SessionId>, message: &ServerMessage) -> usize;
}

impl Delivery for Registry {
    fn send_to(&self, session_id: &SessionId, message: ServerMessage) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => self.push(session, message),
            None => false,
        }
    }

    fn deliver_to_room(
        &self,
        project_id: &str,
        exclude: Option<&SessionId>,
        message: &ServerMessage,
    ) -> usize {
        let Some(room) = self.rooms.get(project_id) else {
            return 0;
        };
        room.members
            .iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| self.sessions.get(id))
            .filter(|session| self.push(session, message.clone()))
            .count()
    }

    fn deliver_to_all(&self, exclude: Option<&SessionId>, message: &ServerMessage) -> usize {
        self.sessions
            .values()
            .filter(|session| Some(&session.id) != exclude)
            .filter(|session| self.push(session, message.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::protocol::ErrorPayload;

    fn sid(value: &str) -> SessionId {
        SessionId::from(value)
    }

    fn identity(name: &str) -> Identity {
        Identity {
            name: name.to_string(),
            avatar: None,
        }
    }

    fn add(registry: &mut Registry, id: &str, name: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(8);
        registry.insert_session(sid(id), tx);
        registry.set_identity(&sid(id), identity(name));
        rx
    }

    fn ping(tag: &str) -> ServerMessage {
        ServerMessage::Error(ErrorPayload {
            code: tag.to_string(),
            message: tag.to_string(),
        })
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn join_creates_room_and_switching_leaves_previous() {
        let mut registry = Registry::default();
        let _a = add(&mut registry, "sess-1", "Alice");

        let first = registry.join_room(&sid("sess-1"), "proj1").expect("join");
        assert!(first.created);
        assert!(first.left.is_none());
        assert!(registry.has_room("proj1"));

        let second = registry.join_room(&sid("sess-1"), "proj2").expect("switch");
        let left = second.left.expect("left previous");
        assert_eq!(left.project_id, "proj1");
        assert!(left.room_removed);
        assert_eq!(
            left.user.and_then(|user| user.current_project).as_deref(),
            Some("proj1")
        );
        assert!(!registry.has_room("proj1"));
        assert_eq!(registry.room_members("proj2"), vec![sid("sess-1")]);
        registry.assert_consistent();
    }

    #[test]
    fn rejoining_current_room_is_idempotent() {
        let mut registry = Registry::default();
        let _a = add(&mut registry, "sess-1", "Alice");
        registry.join_room(&sid("sess-1"), "proj1");

        let again = registry.join_room(&sid("sess-1"), "proj1").expect("rejoin");
        assert!(again.already_member);
        assert!(again.left.is_none());
        assert_eq!(registry.room_members("proj1").len(), 1);
        registry.assert_consistent();
    }

    #[test]
    fn leave_keeps_room_while_members_remain() {
        let mut registry = Registry::default();
        let _a = add(&mut registry, "sess-1", "Alice");
        let _b = add(&mut registry, "sess-2", "Bob");
        registry.join_room(&sid("sess-1"), "proj1");
        registry.join_room(&sid("sess-2"), "proj1");

        let left = registry.leave_room(&sid("sess-1")).expect("leave");
        assert!(!left.room_removed);
        assert_eq!(registry.room_members("proj1"), vec![sid("sess-2")]);
        assert!(registry.leave_room(&sid("sess-1")).is_none());
        registry.assert_consistent();
    }

    #[test]
    fn remove_session_cleans_membership_and_empty_room() {
        let mut registry = Registry::default();
        let _a = add(&mut registry, "sess-1", "Alice");
        registry.join_room(&sid("sess-1"), "proj1");

        let (session, left) = registry.remove_session(&sid("sess-1")).expect("remove");
        assert_eq!(session.id, sid("sess-1"));
        assert!(left.expect("left").room_removed);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.roster("proj1").is_empty());
        assert!(registry.remove_session(&sid("sess-1")).is_none());
    }

    #[test]
    fn roster_resolves_identities_in_session_order() {
        let mut registry = Registry::default();
        let _b = add(&mut registry, "sess-2", "Bob");
        let _a = add(&mut registry, "sess-1", "Alice");
        registry.join_room(&sid("sess-2"), "proj1");
        registry.join_room(&sid("sess-1"), "proj1");

        let names = registry
            .roster("proj1")
            .into_iter()
            .map(|user| user.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn room_delivery_skips_sender_and_outsiders() {
        let mut registry = Registry::default();
        let mut a = add(&mut registry, "sess-1", "Alice");
        let mut b = add(&mut registry, "sess-2", "Bob");
        let mut c = add(&mut registry, "sess-3", "Carol");
        registry.join_room(&sid("sess-1"), "proj1");
        registry.join_room(&sid("sess-2"), "proj1");
        registry.join_room(&sid("sess-3"), "proj2");

        let delivered = registry.deliver_to_room("proj1", Some(&sid("sess-1")), &ping("room"));
        assert_eq!(delivered, 1);
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![ping("room")]);
        assert!(drain(&mut c).is_empty());

        assert_eq!(registry.deliver_to_room("nowhere", None, &ping("x")), 0);
    }

    #[test]
    fn global_delivery_reaches_everyone_but_excluded() {
        let mut registry = Registry::default();
        let mut a = add(&mut registry, "sess-1", "Alice");
        let mut b = add(&mut registry, "sess-2", "Bob");
        let (tx, mut anon) = mpsc::channel(8);
        registry.insert_session(sid("sess-3"), tx);

        assert_eq!(registry.deliver_to_all(Some(&sid("sess-2")), &ping("all")), 2);
        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
        assert_eq!(drain(&mut anon).len(), 1);

        assert_eq!(registry.deliver_to_all(None, &ping("all")), 3);
    }

    #[test]
    fn full_outbox_drops_message_without_blocking() {
        let mut registry = Registry::default();
        let (tx, mut rx) = mpsc::channel(1);
        registry.insert_session(sid("sess-1"), tx);

        assert!(registry.send_to(&sid("sess-1"), ping("first")));
        assert!(!registry.send_to(&sid("sess-1"), ping("second")));
        assert_eq!(drain(&mut rx), vec![ping("first")]);
        assert!(!registry.send_to(&sid("missing"), ping("x")));
    }

    #[test]
    fn unauthenticated_members_are_left_out_of_roster() {
        let mut registry = Registry::default();
        let (tx, _rx) = mpsc::channel(8);
        registry.insert_session(sid("sess-1"), tx);
        registry.join_room(&sid("sess-1"), "proj1");
        assert_eq!(registry.room_members("proj1").len(), 1);
        assert!(registry.roster("proj1").is_empty());
    }

    #[test]
    fn stale_sessions_reports_silent_connections() {
        let mut registry = Registry::default();
        let _a = add(&mut registry, "sess-1", "Alice");
        std::thread::sleep(Duration::from_millis(20));
        let _b = add(&mut registry, "sess-2", "Bob");

        let stale = registry.stale_sessions(Duration::from_millis(10));
        assert_eq!(stale, vec![sid("sess-1")]);

        assert!(registry.is_stale(&sid("sess-1"), Duration::from_millis(10)));
        registry.touch(&sid("sess-1"));
        assert!(registry.stale_sessions(Duration::from_millis(10)).is_empty());
        assert!(!registry.is_stale(&sid("sess-1"), Duration::from_millis(10)));
        assert!(!registry.is_stale(&sid("sess-9"), Duration::ZERO));
    }
}
