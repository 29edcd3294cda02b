//! Session registry (§4.7 "Session registry"): the single source of truth for
//! session lookup. Every handler resolves `(session_id | default)` through here so a
//! change of default is immediately visible to every in-flight command.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::session::Session;

const DEFAULT_SESSION_NAME: &str = "default";

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    default_name: RwLock<String>,
}

impl SessionRegistry {
    /// A registry with one pre-created session named `default` (§3.1 "created
    /// explicitly or implicitly as 'default'").
    pub fn new(default_history: nodeforge_core::HistoryConfig) -> Self {
        let default = Session::new(DEFAULT_SESSION_NAME, default_history);
        let mut sessions = HashMap::new();
        sessions.insert(DEFAULT_SESSION_NAME.to_string(), default);
        Self {
            sessions: RwLock::new(sessions),
            default_name: RwLock::new(DEFAULT_SESSION_NAME.to_string()),
        }
    }

    pub fn default_name(&self) -> String {
        self.default_name.read().clone()
    }

    /// Resolves `id`, falling back to whichever session is currently designated
    /// default when `id` is `None`.
    pub fn get_session(&self, id: Option<&str>) -> Result<Arc<Session>> {
        let name = id.map(str::to_string).unwrap_or_else(|| self.default_name());
        self.sessions
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| ServerError::SessionNotFound(name))
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn add_session(&self, name: impl Into<String>, history: nodeforge_core::HistoryConfig) -> Result<Arc<Session>> {
        let name = name.into();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&name) {
            return Err(ServerError::InvalidRequest(format!("session {name:?} already exists")));
        }
        let session = Session::new(name.clone(), history);
        sessions.insert(name, session.clone());
        Ok(session)
    }

    /// Removes a session. The default session cannot be removed (§3.1: one session is
    /// always designated default and must remain resolvable).
    pub fn remove_session(&self, name: &str) -> Result<Arc<Session>> {
        if name == self.default_name() {
            return Err(ServerError::InvalidRequest(
                "the default session cannot be removed".to_string(),
            ));
        }
        self.sessions
            .write()
            .remove(name)
            .ok_or_else(|| ServerError::SessionNotFound(name.to_string()))
    }

    pub fn list_session_names(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn get_all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Reassigns the default session. Observable to every component that reads
    /// through the registry (§3.1).
    pub fn set_default(&self, name: &str) -> Result<()> {
        if !self.has_session(name) {
            return Err(ServerError::SessionNotFound(name.to_string()));
        }
        *self.default_name.write() = name.to_string();
        Ok(())
    }
}
