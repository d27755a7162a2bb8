use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Access role resolved by the external authentication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = InvalidRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [UserRole::Admin, UserRole::User]
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| InvalidRole(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid role: {0}")]
pub struct InvalidRole(pub String);

/// A caller: identity id plus its resolved role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: UserRole,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, UserRole::Admin)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, UserRole::User)
    }

    /// Build an identity from raw strings, parsing the role
    pub fn parse(id: impl Into<String>, role: &str) -> Result<Self, InvalidRole> {
        Ok(Self::new(id, role.parse()?))
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!("Admin".parse::<UserRole>().unwrap(), UserRole::Admin);
        assert_eq!("USER".parse::<UserRole>().unwrap(), UserRole::User);
        assert_eq!("admin".parse::<UserRole>().unwrap(), UserRole::Admin);
    }

    #[test]
    fn test_parse_invalid_role() {
        let err = "superuser".parse::<UserRole>().unwrap_err();
        assert_eq!(err, InvalidRole("superuser".to_string()));
        assert!(" admin".parse::<UserRole>().is_err());
        assert!("".parse::<UserRole>().is_err());
    }

    #[test]
    fn test_identity_parse() {
        let identity = Identity::parse("alice", "User").unwrap();
        assert_eq!(identity.role, UserRole::User);
        assert!(!identity.is_admin());
        assert!(Identity::parse("bob", "root").is_err());
    }
}
