//! Capability-set authorization shared by the rule store and alert tracker

use serde::Serialize;
use std::fmt;

use crate::model::{Identity, UserRole};

/// Operations guarded at rule store and tracker entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReadRule,
    CreateRule,
    UpdateRule,
    DeleteRule,
    ReadAlert,
    /// Connector-level diagnostics for a rule
    ReadEvaluationErrors,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::ReadRule => "read_rule",
            Action::CreateRule => "create_rule",
            Action::UpdateRule => "update_rule",
            Action::DeleteRule => "delete_rule",
            Action::ReadAlert => "read_alert",
            Action::ReadEvaluationErrors => "read_evaluation_errors",
        };
        f.write_str(name)
    }
}

/// The thing being acted on, identified by its owner
#[derive(Debug, Clone, Copy)]
pub struct Resource<'a> {
    pub owner: &'a str,
}

impl<'a> Resource<'a> {
    pub fn owned_by(owner: &'a str) -> Self {
        Self { owner }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only resources whose owner is the caller
    Own,
    /// Any resource
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub action: Action,
    pub scope: Scope,
}

const fn cap(action: Action, scope: Scope) -> Capability {
    Capability { action, scope }
}

const ADMIN_CAPABILITIES: &[Capability] = &[
    cap(Action::ReadRule, Scope::Any),
    cap(Action::CreateRule, Scope::Any),
    cap(Action::UpdateRule, Scope::Any),
    cap(Action::DeleteRule, Scope::Any),
    cap(Action::ReadAlert, Scope::Any),
    cap(Action::ReadEvaluationErrors, Scope::Any),
];

const USER_CAPABILITIES: &[Capability] = &[
    cap(Action::ReadRule, Scope::Own),
    cap(Action::CreateRule, Scope::Own),
    cap(Action::UpdateRule, Scope::Own),
    cap(Action::DeleteRule, Scope::Own),
    cap(Action::ReadAlert, Scope::Own),
];

/// Capability set granted to a role
pub fn capabilities(role: UserRole) -> &'static [Capability] {
    match role {
        UserRole::Admin => ADMIN_CAPABILITIES,
        UserRole::User => USER_CAPABILITIES,
    }
}

/// Authorization decision point
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGuard;

impl AccessGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn authorize(&self, identity: &Identity, action: Action, resource: Resource<'_>) -> bool {
        capabilities(identity.role).iter().any(|c| {
            c.action == action
                && match c.scope {
                    Scope::Any => true,
                    Scope::Own => resource.owner == identity.id,
                }
        })
    }

    /// Like [`authorize`](Self::authorize) but fails with [`AccessDenied`]
    pub fn require(
        &self,
        identity: &Identity,
        action: Action,
        resource: Resource<'_>,
    ) -> Result<(), AccessDenied> {
        if self.authorize(identity, action, resource) {
            Ok(())
        } else {
            tracing::debug!(
                identity = %identity.id,
                role = %identity.role,
                action = %action,
                owner = %resource.owner,
                "Access denied"
            );
            Err(AccessDenied {
                identity: identity.id.clone(),
                action,
            })
        }
    }

    /// Whether the role may act on resources it does not own
    pub fn has_any_scope(&self, identity: &Identity, action: Action) -> bool {
        capabilities(identity.role)
            .iter()
            .any(|c| c.action == action && c.scope == Scope::Any)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Access denied: {identity} may not {action}")]
pub struct AccessDenied {
    pub identity: String,
    pub action: Action,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_superset_of_user() {
        for user_cap in capabilities(UserRole::User) {
            assert!(capabilities(UserRole::Admin)
                .iter()
                .any(|c| c.action == user_cap.action && c.scope == Scope::Any));
        }
    }

    #[test]
    fn test_user_own_resources_only() {
        let guard = AccessGuard::new();
        let alice = Identity::user("alice");

        assert!(guard.authorize(&alice, Action::ReadRule, Resource::owned_by("alice")));
        assert!(guard.authorize(&alice, Action::UpdateRule, Resource::owned_by("alice")));
        assert!(!guard.authorize(&alice, Action::ReadRule, Resource::owned_by("bob")));
        assert!(!guard.authorize(&alice, Action::DeleteRule, Resource::owned_by("bob")));
    }

    #[test]
    fn test_admin_any_resource() {
        let guard = AccessGuard::new();
        let root = Identity::admin("root");

        assert!(guard.authorize(&root, Action::DeleteRule, Resource::owned_by("bob")));
        assert!(guard.authorize(&root, Action::ReadEvaluationErrors, Resource::owned_by("bob")));
    }

    #[test]
    fn test_evaluation_errors_admin_only() {
        let guard = AccessGuard::new();
        let alice = Identity::user("alice");
        let err = guard
            .require(&alice, Action::ReadEvaluationErrors, Resource::owned_by("alice"))
            .unwrap_err();
        assert_eq!(err.action, Action::ReadEvaluationErrors);
        assert_eq!(err.identity, "alice");
    }
}
