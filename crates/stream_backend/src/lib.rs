pub mod provider;

use std::collections::BTreeSet;

use thiserror::Error;

// Re-export main types
pub use provider::{create_backend, BackendAdapter, BackendType};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("NetworkError: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Unexpected status: {0}")]
    Status(reqwest::StatusCode),
    #[error("ParseError: {0}")]
    Parse(String),
    #[error("AuthError: {0}")]
    Auth(String),
    #[error("UnsupportedBackend: {0}")]
    UnsupportedBackend(String),
}

/// Login credentials for backends that require them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// One active stream as reported by a single backend poll.
///
/// Snapshots are replaced wholesale on every poll, they are never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub id: String,
    pub name: String,
    /// User agents of every client currently pulling the stream
    pub clients: BTreeSet<String>,
}

impl StreamSnapshot {
    pub fn new<I, S>(id: &str, name: &str, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            clients: clients.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_client(&self, user_agent: &str) -> bool {
        self.clients.contains(user_agent)
    }
}

/// Backends report ids either as strings or as integers.
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
