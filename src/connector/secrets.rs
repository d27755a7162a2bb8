//! Credential lookup. Rules carry only a reference; secrets live elsewhere.

use std::collections::HashMap;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// External secret collaborator
pub trait SecretResolver: Send + Sync {
    /// Resolve a credentials reference. `None` if the reference is unknown.
    fn resolve(&self, reference: &str) -> Option<Credentials>;
}

/// Reads `BEACON_SECRET_<REF>_USERNAME` and `BEACON_SECRET_<REF>_PASSWORD`.
/// The reference is upper-cased and `-`/`.` become `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    pub fn new() -> Self {
        Self
    }

    fn var_prefix(reference: &str) -> String {
        let normalized: String = reference
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("BEACON_SECRET_{}", normalized)
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &str) -> Option<Credentials> {
        let prefix = Self::var_prefix(reference);
        let username = std::env::var(format!("{}_USERNAME", prefix)).ok()?;
        let password = std::env::var(format!("{}_PASSWORD", prefix)).unwrap_or_default();
        Some(Credentials { username, password })
    }
}

/// Fixed in-memory secrets
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, Credentials>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, reference: impl Into<String>, credentials: Credentials) -> Self {
        self.secrets.insert(reference.into(), credentials);
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, reference: &str) -> Option<Credentials> {
        self.secrets.get(reference).cloned()
    }
}
