//! Registry of live sessions with replica accounting and idle eviction.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{Session, SessionError, SessionResult, SessionSummary};
use crate::sync::SessionId;

/// Owner of all live sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Maximum replicas attached to one session
    max_replicas: usize,
}

impl SessionRegistry {
    pub fn new(max_replicas: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_replicas,
        }
    }

    /// Create a new session; fails if the id is taken
    pub fn create(&self, id: &str, name: &str) -> SessionResult<Arc<Session>> {
        match self.sessions.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SessionError::AlreadyExists(id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(id, name));
                entry.insert(session.clone());
                info!("Created session: {} ({})", name, id);
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Get or create a session named after its id
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("Created session: {}", id);
                Arc::new(Session::new(id, id))
            })
            .clone()
    }

    /// Remove a session and everything it owns
    pub fn evict(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            info!("Evicted session: {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Register a connected replica with a session, creating it on demand
    pub fn attach_replica(&self, id: &str) -> SessionResult<Arc<Session>> {
        let session = self.get_or_create(id);
        if session.replica_count() >= self.max_replicas {
            return Err(SessionError::SessionFull {
                id: id.to_string(),
                max: self.max_replicas,
            });
        }
        session.attach();
        Ok(session)
    }

    /// Returns the number of replicas still attached
    pub fn detach_replica(&self, id: &str) -> usize {
        self.get(id).map(|session| session.detach()).unwrap_or(0)
    }

    /// Evict sessions that have had no replicas for at least `grace`
    pub fn collect_garbage(&self, grace: Duration) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.idle_for().map_or(false, |idle| idle >= grace))
            .map(|entry| entry.key().clone())
            .collect();

        idle.into_iter()
            .filter(|id| {
                self.sessions
                    .remove_if(id, |_, session| session.replica_count() == 0)
                    .is_some()
            })
            .inspect(|id| info!("Evicted idle session: {}", id))
            .collect()
    }

    /// Summaries of all sessions, ordered by id
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions.iter().map(|entry| entry.summary()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Replicas attached across all sessions
    pub fn replica_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.replica_count()).sum()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_session() {
        let registry = SessionRegistry::default();
        let session = registry.create("demo", "Demo").unwrap();
        assert_eq!(session.id(), "demo");
        assert_eq!(session.name(), "Demo");
        assert!(matches!(
            registry.create("demo", "Again"),
            Err(SessionError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_get_or_create_session() {
        let registry = SessionRegistry::default();
        let first = registry.get_or_create("demo");
        let second = registry.get_or_create("demo");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_evict_session() {
        let registry = SessionRegistry::default();
        registry.create("demo", "Demo").unwrap();
        assert!(registry.contains("demo"));
        assert!(registry.evict("demo").is_some());
        assert!(!registry.contains("demo"));
        assert!(registry.evict("demo").is_none());
    }

    #[test]
    fn test_replica_limit() {
        let registry = SessionRegistry::new(2);
        registry.attach_replica("demo").unwrap();
        registry.attach_replica("demo").unwrap();
        assert!(matches!(
            registry.attach_replica("demo"),
            Err(SessionError::SessionFull { max: 2, .. })
        ));
        assert_eq!(registry.replica_count(), 2);
        assert_eq!(registry.detach_replica("demo"), 1);
    }

    #[test]
    fn test_garbage_collection_spares_attached_sessions() {
        let registry = SessionRegistry::default();
        registry.attach_replica("busy").unwrap();
        registry.create("idle", "Idle").unwrap();

        let evicted = registry.collect_garbage(Duration::ZERO);
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(registry.contains("busy"));

        registry.detach_replica("busy");
        assert!(registry.collect_garbage(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.collect_garbage(Duration::ZERO), vec!["busy".to_string()]);
    }

    #[test]
    fn test_list_sessions() {
        let registry = SessionRegistry::default();
        registry.create("b", "B").unwrap();
        let a = registry.create("a", "A").unwrap();
        a.seed_file("main.rs", "fn main() {}").unwrap();

        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].files, vec!["main.rs"]);
    }
}
