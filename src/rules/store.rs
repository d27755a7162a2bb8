//! Access-guarded alert rule store

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use crate::access::{AccessDenied, AccessGuard, Action, Resource};
use crate::model::{AlertRule, Identity, RuleId, ValidationError};

/// In-memory rule store. Exclusive owner of the rule lifecycle.
pub struct RuleStore {
    rules: RwLock<HashMap<RuleId, AlertRule>>,
    guard: AccessGuard,
    /// Store-wide, so a recreated rule never reuses a revision
    revisions: AtomicU64,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::with_guard(AccessGuard::new())
    }

    pub fn with_guard(guard: AccessGuard) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            guard,
            revisions: AtomicU64::new(1),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed)
    }

    /// Access and invariant checks for a rule about to be created
    fn check_new(&self, identity: &Identity, rule: &AlertRule) -> Result<(), RuleStoreError> {
        self.guard
            .require(identity, Action::CreateRule, Resource::owned_by(&rule.owner))?;
        rule.validate()?;
        Ok(())
    }

    fn stamp_new(&self, rule: &mut AlertRule) {
        let now = Utc::now();
        rule.revision = self.next_revision();
        rule.created_at = now;
        rule.updated_at = now;
    }

    /// Get a rule by ID
    pub fn get(&self, identity: &Identity, id: &str) -> Result<AlertRule, RuleStoreError> {
        let rules = self.rules.read();
        let rule = rules
            .get(id)
            .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
        self.guard
            .require(identity, Action::ReadRule, Resource::owned_by(&rule.owner))?;
        Ok(rule.clone())
    }

    /// List rules visible to the caller.
    ///
    /// Without an owner filter, admins see every rule and users see their own.
    /// A user asking for another owner's rules is denied, not filtered.
    pub fn list(
        &self,
        identity: &Identity,
        owner_filter: Option<&str>,
    ) -> Result<Vec<AlertRule>, RuleStoreError> {
        let owner = match owner_filter {
            Some(owner) => {
                self.guard
                    .require(identity, Action::ReadRule, Resource::owned_by(owner))?;
                Some(owner)
            }
            None if self.guard.has_any_scope(identity, Action::ReadRule) => None,
            None => Some(identity.id.as_str()),
        };

        let rules = self.rules.read();
        let mut listed: Vec<AlertRule> = rules
            .values()
            .filter(|r| owner.map(|o| r.owner == o).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    /// Create a new rule
    pub fn create(&self, identity: &Identity, mut rule: AlertRule) -> Result<AlertRule, RuleStoreError> {
        self.check_new(identity, &rule)?;

        let mut rules = self.rules.write();
        if rules.contains_key(&rule.id) {
            return Err(ValidationError::DuplicateId(rule.id).into());
        }

        self.stamp_new(&mut rule);
        rules.insert(rule.id.clone(), rule.clone());

        tracing::info!(rule_id = %rule.id, owner = %rule.owner, "Rule created");
        Ok(rule)
    }

    /// Replace an existing rule. Bumps its revision.
    pub fn update(&self, identity: &Identity, mut rule: AlertRule) -> Result<AlertRule, RuleStoreError> {
        let mut rules = self.rules.write();
        let existing = rules
            .get(&rule.id)
            .ok_or_else(|| RuleStoreError::NotFound(rule.id.clone()))?;

        self.guard
            .require(identity, Action::UpdateRule, Resource::owned_by(&existing.owner))?;
        if rule.owner != existing.owner {
            self.guard
                .require(identity, Action::UpdateRule, Resource::owned_by(&rule.owner))?;
        }
        rule.validate()?;

        rule.revision = self.next_revision();
        rule.created_at = existing.created_at;
        rule.updated_at = Utc::now();
        rules.insert(rule.id.clone(), rule.clone());

        tracing::info!(rule_id = %rule.id, revision = rule.revision, "Rule updated");
        Ok(rule)
    }

    /// Enable or disable a rule
    pub fn set_enabled(
        &self,
        identity: &Identity,
        id: &str,
        enabled: bool,
    ) -> Result<AlertRule, RuleStoreError> {
        let mut rules = self.rules.write();
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
        self.guard
            .require(identity, Action::UpdateRule, Resource::owned_by(&rule.owner))?;

        if rule.enabled != enabled {
            rule.enabled = enabled;
            rule.revision = self.next_revision();
            rule.updated_at = Utc::now();
            tracing::info!(rule_id = %id, enabled, "Rule enablement changed");
        }
        Ok(rule.clone())
    }

    /// Delete a rule
    pub fn delete(&self, identity: &Identity, id: &str) -> Result<AlertRule, RuleStoreError> {
        let mut rules = self.rules.write();
        let owner = rules
            .get(id)
            .map(|r| r.owner.clone())
            .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
        self.guard
            .require(identity, Action::DeleteRule, Resource::owned_by(&owner))?;

        let removed = rules
            .remove(id)
            .ok_or_else(|| RuleStoreError::NotFound(id.to_string()))?;
        tracing::info!(rule_id = %id, "Rule deleted");
        Ok(removed)
    }

    /// Seed rules from a JSON array file, created on behalf of `identity`.
    /// Nothing is stored unless every rule in the file is accepted.
    pub fn load_file(&self, identity: &Identity, path: impl AsRef<Path>) -> Result<usize, RuleStoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuleStoreError::Load(format!("{}: {}", path.display(), e)))?;
        let rules: Vec<AlertRule> = serde_json::from_str(&content)
            .map_err(|e| RuleStoreError::Load(format!("{}: {}", path.display(), e)))?;

        for rule in &rules {
            self.check_new(identity, rule)?;
        }

        let mut stored = self.rules.write();
        {
            let mut seen = HashSet::new();
            for rule in &rules {
                if stored.contains_key(&rule.id) || !seen.insert(rule.id.as_str()) {
                    return Err(ValidationError::DuplicateId(rule.id.clone()).into());
                }
            }
        }

        let count = rules.len();
        for mut rule in rules {
            self.stamp_new(&mut rule);
            stored.insert(rule.id.clone(), rule);
        }
        drop(stored);
        tracing::info!(count, path = %path.display(), "Loaded rules from file");
        Ok(count)
    }

    /// Every rule, bypassing access control. Scheduler use only.
    pub(crate) fn snapshot(&self) -> Vec<AlertRule> {
        self.rules.read().values().cloned().collect()
    }

    /// Run `f` against the current definition while holding the read lock.
    /// Mutations wait until `f` returns.
    pub(crate) fn with_rule<R>(&self, id: &str, f: impl FnOnce(Option<&AlertRule>) -> R) -> R {
        let rules = self.rules.read();
        f(rules.get(id))
    }

    /// Owner of a rule, bypassing access control
    pub(crate) fn owner_of(&self, id: &str) -> Option<String> {
        self.rules.read().get(id).map(|r| r.owner.clone())
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleStoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Failed to load rules: {0}")]
    Load(String),
}
