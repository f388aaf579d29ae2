//
// session_registry.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::KGError;
use crate::session::Session;

/// The live sessions, keyed by session ID. A session is present from the
/// moment it becomes active until its teardown has finished.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; its ID must not already be in use.
    pub async fn insert(&self, session: Arc<Session>) -> Result<(), KGError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(KGError::SessionExists(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>, KGError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| KGError::SessionNotFound(session_id.to_string()))
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove and return every session, leaving the registry empty.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions.drain().map(|(_, session)| session).collect()
    }
}
