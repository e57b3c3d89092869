use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Token bound to one logical run of a download. Spawned tasks capture it
/// and re-check [`SessionManager::is_current`] after every suspension point
/// before mutating state; a pause or cancel rotates the token, turning late
/// callbacks into no-ops.
#[derive(Debug, Clone)]
pub struct SessionToken {
    download_id: i64,
    value: Arc<String>,
}

impl SessionToken {
    pub fn download_id(&self) -> i64 {
        self.download_id
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

#[derive(Clone, Default)]
pub struct SessionManager {
    active: Arc<Mutex<HashMap<i64, Arc<String>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token for a download, superseding any previous one.
    pub fn issue(&self, download_id: i64) -> SessionToken {
        let value = Arc::new(Uuid::new_v4().to_string());
        if let Ok(mut active) = self.active.lock() {
            active.insert(download_id, value.clone());
        }
        SessionToken { download_id, value }
    }

    pub fn is_current(&self, token: &SessionToken) -> bool {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(&token.download_id).cloned())
            .map(|current| Arc::ptr_eq(&current, &token.value) || *current == *token.value)
            .unwrap_or(false)
    }

    pub fn invalidate(&self, download_id: i64) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&download_id);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut active) = self.active.lock() {
            active.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_is_current_until_invalidated() {
        let sessions = SessionManager::new();
        let token = sessions.issue(1);
        assert!(sessions.is_current(&token));

        sessions.invalidate(1);
        assert!(!sessions.is_current(&token));
    }

    #[test]
    fn reissue_supersedes_previous_token() {
        let sessions = SessionManager::new();
        let stale = sessions.issue(1);
        let fresh = sessions.issue(1);
        assert!(!sessions.is_current(&stale));
        assert!(sessions.is_current(&fresh));
    }

    #[test]
    fn tokens_are_scoped_per_download() {
        let sessions = SessionManager::new();
        let a = sessions.issue(1);
        let b = sessions.issue(2);
        sessions.invalidate(1);
        assert!(!sessions.is_current(&a));
        assert!(sessions.is_current(&b));

        sessions.invalidate_all();
        assert!(!sessions.is_current(&b));
    }
}
