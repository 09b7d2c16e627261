//! Pending HTTP-01 challenges
//!
//! The ACME issuer publishes key authorizations here while an order is open;
//! the plain HTTP listener answers `/.well-known/acme-challenge/{token}` from it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// HTTP-01 challenge data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: String,
    pub key_authorization: String,
}

/// Shared token → key authorization map
#[derive(Debug, Clone, Default)]
pub struct Http01ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, challenge: Http01Challenge) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(challenge.token, challenge.key_authorization);
        }
    }

    pub fn remove(&self, token: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(token);
        }
    }

    /// Key authorization for `token`, if a challenge with that token is pending
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.read().ok()?.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|tokens| tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let store = Http01ChallengeStore::new();
        store.insert(Http01Challenge {
            token: "tok".to_string(),
            key_authorization: "tok.thumb".to_string(),
        });

        assert_eq!(store.key_authorization("tok").as_deref(), Some("tok.thumb"));
        assert_eq!(store.key_authorization("other"), None);

        store.remove("tok");
        assert!(store.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let store = Http01ChallengeStore::new();
        let responder_view = store.clone();

        store.insert(Http01Challenge {
            token: "a".to_string(),
            key_authorization: "a.b".to_string(),
        });

        assert_eq!(responder_view.len(), 1);
    }
}
