//! Auth Manager: validates the single process API key, mints ephemeral
//! session tokens, and validates both raw-key and token Bearer headers
//! for REST.
//!
//! Token generation grounded on `gateway::auth::generate_token`: 32
//! random bytes, URL-safe base64 without padding.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::Engine;
use rand::RngCore;

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_token: String,
    pub client_id: Option<String>,
    pub client_type: Option<String>,
}

pub struct AuthManager {
    api_key: Option<String>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl AuthManager {
    /// `api_key = None` puts the manager in open mode: every `apiKey`
    /// value is accepted.
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key, sessions: RwLock::new(HashMap::new()) }
    }

    pub fn is_open_mode(&self) -> bool {
        self.api_key.is_none()
    }

    /// Validate a raw API key against the configured key (or accept any
    /// key in open mode). On success, mints and records a new session.
    pub fn validate_api_key(
        &self,
        provided: &str,
        client_id: Option<String>,
        client_type: Option<String>,
    ) -> Option<Session> {
        let ok = match &self.api_key {
            Some(key) => key == provided,
            None => true,
        };
        if !ok {
            return None;
        }
        let session = Session { session_token: generate_token(), client_id, client_type };
        self.sessions.write().unwrap().insert(session.session_token.clone(), session.clone());
        Some(session)
    }

    pub fn validate_session(&self, token: &str) -> Option<Session> {
        self.sessions.read().unwrap().get(token).cloned()
    }

    /// Validate a REST `Authorization: Bearer <value>` header, accepting
    /// either a live session token or the raw API key itself.
    pub fn validate_bearer(&self, header: &str) -> bool {
        let Some(value) = header.strip_prefix("Bearer ") else { return false };
        if self.sessions.read().unwrap().contains_key(value) {
            return true;
        }
        match &self.api_key {
            Some(key) => key == value,
            None => true,
        }
    }

    /// Invalidate a session immediately; its token is never reused.
    pub fn remove_session(&self, token: &str) -> bool {
        self.sessions.write().unwrap().remove(token).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_key_mints_unique_session_tokens() {
        let auth = AuthManager::new(Some("test-relay-key".into()));
        let s1 = auth.validate_api_key("test-relay-key", None, None).unwrap();
        let s2 = auth.validate_api_key("test-relay-key", None, None).unwrap();
        assert_ne!(s1.session_token, s2.session_token);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let auth = AuthManager::new(Some("test-relay-key".into()));
        assert!(auth.validate_api_key("wrong", None, None).is_none());
    }

    #[test]
    fn open_mode_accepts_any_key() {
        let auth = AuthManager::new(None);
        assert!(auth.validate_api_key("anything", None, None).is_some());
    }

    #[test]
    fn removed_session_is_invalid_for_both_session_and_bearer_checks() {
        let auth = AuthManager::new(Some("k".into()));
        let session = auth.validate_api_key("k", None, None).unwrap();
        assert!(auth.remove_session(&session.session_token));

        assert!(auth.validate_session(&session.session_token).is_none());
        let header = format!("Bearer {}", session.session_token);
        assert!(!auth.validate_bearer(&header));
    }

    #[test]
    fn bearer_accepts_raw_api_key_or_session_token() {
        let auth = AuthManager::new(Some("raw-key".into()));
        assert!(auth.validate_bearer("Bearer raw-key"));

        let session = auth.validate_api_key("raw-key", None, None).unwrap();
        assert!(auth.validate_bearer(&format!("Bearer {}", session.session_token)));
    }
}
