//! Swift API emulator over any [`Connection`].

pub mod error;
pub mod health_handlers;
pub mod swift_handlers;

use crate::connection::Connection;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Shared state of the emulator routes.
#[derive(Clone)]
pub struct EmulatorState {
    pub backend: Arc<dyn Connection>,
    pub account: String,
    pub user: String,
    pub key: String,
    tokens: Arc<Mutex<HashSet<String>>>,
}

impl EmulatorState {
    pub fn new(
        backend: Arc<dyn Connection>,
        account: impl Into<String>,
        user: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            account: account.into(),
            user: user.into(),
            key: key.into(),
            tokens: Arc::default(),
        }
    }

    /// Accepts the configured user either whole (`test:tester`) or by its
    /// part after the colon, the way Keystone clients send it.
    pub fn credentials_match(&self, user: &str, key: &str) -> bool {
        let short = self
            .user
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(&self.user);
        (user == self.user || user == short) && key == self.key
    }

    pub fn issue_token(&self) -> String {
        let token = format!("tk_{}", Uuid::new_v4().simple());
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone());
        token
    }

    pub fn token_valid(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(token)
    }

    /// Invalidate every issued token, forcing clients to authenticate again.
    pub fn revoke_tokens(&self) {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
