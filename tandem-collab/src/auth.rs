//! Access control for document sessions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What a user may do with a document, ordered from least to most access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Read,
    Edit,
    Create,
}

/// Decides the access level of a user token for a document.
pub trait Authenticator: Send + Sync {
    /// An empty `document_id` asks whether the user may create documents.
    fn authenticate(&self, user_id: &str, token: &str, document_id: &str) -> AccessLevel;
}

/// Grants everyone edit access, and create access when allowed.
#[derive(Debug, Clone, Copy)]
pub struct Anarchy {
    pub allow_create: bool,
}

impl Authenticator for Anarchy {
    fn authenticate(&self, _user_id: &str, _token: &str, document_id: &str) -> AccessLevel {
        match (self.allow_create, document_id.is_empty()) {
            (true, _) => AccessLevel::Create,
            (false, true) => AccessLevel::None,
            (false, false) => AccessLevel::Edit,
        }
    }
}

/// Static token table. Unknown tokens get no access.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, AccessLevel>,
}

impl TokenTable {
    pub fn new(tokens: HashMap<String, AccessLevel>) -> Self {
        Self { tokens }
    }

    pub fn insert(&mut self, token: impl Into<String>, level: AccessLevel) {
        self.tokens.insert(token.into(), level);
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, user_id: &str, token: &str, document_id: &str) -> AccessLevel {
        let level = self.tokens.get(token).copied().unwrap_or(AccessLevel::None);
        log::trace!("Token of user {user_id} grants {level:?} on {document_id:?}");
        level
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Anarchy,
    Tokens,
}

/// Authentication configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    /// Whether anarchy lets users create documents (default: true)
    pub allow_create: bool,
    /// Token → access level, for the token table
    pub tokens: HashMap<String, AccessLevel>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: AuthType::Anarchy,
            allow_create: true,
            tokens: HashMap::new(),
        }
    }
}

impl AuthConfig {
    pub fn build(&self) -> Arc<dyn Authenticator> {
        match self.auth_type {
            AuthType::Anarchy => Arc::new(Anarchy {
                allow_create: self.allow_create,
            }),
            AuthType::Tokens => Arc::new(TokenTable::new(self.tokens.clone())),
        }
    }
}
