//! Credential verification for incoming connections
//!
//! A connection is authenticated once, on the HTTP upgrade request, with a
//! basic authorization header. Only the resulting name is handed on to the
//! switch.

use crate::error::AuthError;
use devnet_protocol::basic_auth;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Verifies a name/secret pair
pub trait Credentials: Send + Sync {
    fn verify(&self, name: &str, secret: &str) -> bool;
}

/// A configured user entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// Hex digest produced by [`hash_secret`]
    pub hash: String,
}

/// Digest stored for a user: `hex(sha256("<name>+<secret>"))`
pub fn hash_secret(name: &str, secret: &str) -> String {
    hex::encode(Sha256::digest(format!("{name}+{secret}")))
}

/// Users known from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.name, user.hash.to_ascii_lowercase()))
                .collect(),
        }
    }
}

impl Credentials for StaticCredentials {
    fn verify(&self, name: &str, secret: &str) -> bool {
        match self.users.get(name) {
            Some(hash) => *hash == hash_secret(name, secret),
            None => false,
        }
    }
}

/// Resolve an `Authorization` header value to an authenticated name
pub fn authenticate(credentials: &dyn Credentials, header: Option<&str>) -> Result<String, AuthError> {
    let header = header.ok_or(AuthError::MissingCredentials)?;
    let (name, secret) = basic_auth::decode(header).ok_or(AuthError::MalformedCredentials)?;

    if name.is_empty() || !credentials.verify(&name, &secret) {
        warn!(user = %name, "authorization failed");
        return Err(AuthError::Rejected(name));
    }

    trace!(user = %name, "user authorized");
    Ok(name)
}
