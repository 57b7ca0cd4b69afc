//! Opaque session tokens and the registry that issues them.
//!
//! A [`Token`] names one (caller, extension) load session. Tokens are random
//! v4 UUIDs, so holding one is the only way to address a session. The
//! [`TokenRegistry`] keeps forward and reverse mappings behind its own lock,
//! independent of the manager's state lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::identity::CallerId;

/// Opaque, unguessable handle for one load session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(Uuid);

impl Token {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0.simple())
    }
}

/// The (caller, extension name) pair a token stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    caller: CallerId,
    name: String,
}

impl SessionKey {
    /// Builds a key for the given caller and extension.
    #[must_use]
    pub fn new(caller: CallerId, name: impl Into<String>) -> Self {
        Self {
            caller,
            name: name.into(),
        }
    }

    /// Caller owning the session.
    #[must_use]
    pub const fn caller(&self) -> &CallerId {
        &self.caller
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

#[derive(Debug, Default)]
struct TokenTables {
    forward: HashMap<SessionKey, Token>,
    reverse: HashMap<Token, SessionKey>,
}

/// Issues tokens and resolves them back to their session key.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tables: Mutex<TokenTables>,
}

impl TokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live token for the pair, issuing one when none exists.
    pub fn get_or_create(&self, caller: &CallerId, name: &str) -> Token {
        let key = SessionKey::new(caller.clone(), name);
        let mut tables = self.lock();
        if let Some(token) = tables.forward.get(&key) {
            return *token;
        }
        let token = Token::generate();
        tables.forward.insert(key.clone(), token);
        tables.reverse.insert(token, key);
        token
    }

    /// Resolves a token to the session it names.
    #[must_use]
    pub fn resolve(&self, token: &Token) -> Option<SessionKey> {
        self.lock().reverse.get(token).cloned()
    }

    /// Forgets a token. Destroying an unknown token is a no-op.
    pub fn destroy(&self, token: &Token) {
        let mut tables = self.lock();
        if let Some(key) = tables.reverse.remove(token) {
            tables.forward.remove(&key);
        }
    }

    /// Live tokens issued to the caller.
    #[must_use]
    pub fn tokens_for(&self, caller: &CallerId) -> Vec<Token> {
        self.lock()
            .reverse
            .iter()
            .filter(|(_, key)| key.caller() == caller)
            .map(|(token, _)| *token)
            .collect()
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().reverse.len()
    }

    /// Returns `true` when no tokens are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().reverse.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, TokenTables> {
        self.tables
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
