use crate::{Session, SessionError, SessionStatus};
use collections::FxHashMap;
use parking_lot::RwLock;
use settings::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use transport::{ConnectParams, Connector};

/// Owns every session. The map lock is only held to look sessions up;
/// all network work happens on the session itself.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: Config) -> Self {
        Self {
            connector,
            config: Arc::new(config),
            sessions: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a fresh, unconnected session. Ids are never reused.
    pub fn create_session(&self) -> String {
        let id = format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id.clone(), self.config.clone()));
        self.sessions.write().insert(id.clone(), session);
        tracing::debug!(session_id = %id, "Session created");
        id
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    pub async fn connect(&self, id: &str, params: ConnectParams) -> Result<(), SessionError> {
        let session = self.get(id)?;
        session.connect(self.connector.as_ref(), params).await
    }

    /// Tear the session down and forget it.
    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or(SessionError::NotFound)?;
        session.teardown(None).await;
        tracing::info!(session_id = %id, "Session removed");
        Ok(())
    }

    pub fn status(&self, id: &str) -> SessionStatus {
        match self.get(id) {
            Ok(session) => session.status(),
            Err(_) => SessionStatus::not_found(id),
        }
    }

    /// Ids of every listed session in creation order.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .sessions
            .read()
            .keys()
            .map(|id| (sequence(id), id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Tear down and drop every session, concurrently.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .drain()
            .map(|(_, session)| session)
            .collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Disconnecting all sessions");
        let mut teardowns = tokio::task::JoinSet::new();
        for session in sessions {
            teardowns.spawn(async move { session.teardown(None).await });
        }
        while teardowns.join_next().await.is_some() {}
    }
}

fn sequence(id: &str) -> u64 {
    id.strip_prefix("session-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
