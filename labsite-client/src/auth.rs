//! Bearer token sources.

use labsite_core::TokenProvider;
use std::sync::RwLock;

/// A token fixed at construction (typically from config), or none.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token owned by the admin login session; set on login, cleared on logout.
#[derive(Debug, Default)]
pub struct SessionToken {
    token: RwLock<Option<String>>,
}

impl SessionToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token.into());
    }

    pub fn logout(&self) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn is_logged_in(&self) -> bool {
        self.bearer_token().is_some()
    }
}

impl TokenProvider for SessionToken {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
