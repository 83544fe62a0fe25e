//! Grant records and the pure precedence rules used to merge them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolhost_primitives::{Origin, Scope};

/// Browser tab identifier used to scope temporary grants.
pub type TabId = u64;

/// Stored decision for one origin and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantStatus {
    /// Granted until the TTL deadline.
    GrantedOnce,
    /// Granted until explicitly revoked or denied.
    GrantedAlways,
    /// Refused until explicitly revoked or granted again.
    Denied,
    /// No decision recorded.
    NotGranted,
}

/// How long a consent decision lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// In-memory grant with a fixed TTL.
    Once,
    /// Persisted grant.
    Always,
}

/// Allow/deny/expiry decision for an origin and scope pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    status: GrantStatus,
    granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    /// Creates a persistent grant.
    #[must_use]
    pub fn always(granted_at: DateTime<Utc>) -> Self {
        Self {
            status: GrantStatus::GrantedAlways,
            granted_at,
            expires_at: None,
        }
    }

    /// Creates a grant that lapses at `expires_at`.
    #[must_use]
    pub fn once(granted_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: GrantStatus::GrantedOnce,
            granted_at,
            expires_at: Some(expires_at),
        }
    }

    /// Creates a persistent denial.
    #[must_use]
    pub fn denied(at: DateTime<Utc>) -> Self {
        Self {
            status: GrantStatus::Denied,
            granted_at: at,
            expires_at: None,
        }
    }

    /// Returns the stored status, ignoring expiry.
    #[must_use]
    pub fn status(&self) -> GrantStatus {
        self.status
    }

    /// Returns when the decision was recorded.
    #[must_use]
    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    /// Returns the expiry deadline, if any.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Returns the status as observed at `now`. A once-grant at or past its
    /// deadline reads as [`GrantStatus::NotGranted`].
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> GrantStatus {
        match (self.status, self.expires_at) {
            (GrantStatus::GrantedOnce, Some(deadline)) if now >= deadline => {
                GrantStatus::NotGranted
            }
            (status, _) => status,
        }
    }

    /// Returns `true` when the grant allows the scope at `now`.
    #[must_use]
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status_at(now),
            GrantStatus::GrantedOnce | GrantStatus::GrantedAlways
        )
    }
}

/// Persisted per-origin grant map plus the optional tool allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginPermissionRecord {
    origin: Origin,
    #[serde(default)]
    scopes: BTreeMap<Scope, Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_tools: Option<BTreeSet<String>>,
}

impl OriginPermissionRecord {
    /// Creates an empty record for the origin.
    #[must_use]
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            scopes: BTreeMap::new(),
            allowed_tools: None,
        }
    }

    /// Returns the origin the record belongs to.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Returns the grant recorded for a scope.
    #[must_use]
    pub fn grant(&self, scope: Scope) -> Option<&Grant> {
        self.scopes.get(&scope)
    }

    /// Iterates over every recorded scope.
    pub fn grants(&self) -> impl Iterator<Item = (Scope, &Grant)> {
        self.scopes.iter().map(|(scope, grant)| (*scope, grant))
    }

    /// Records a grant for a scope, replacing the previous one.
    pub fn set_grant(&mut self, scope: Scope, grant: Grant) {
        self.scopes.insert(scope, grant);
    }

    /// Returns the tool allowlist. `None` or an empty set means unrestricted.
    #[must_use]
    pub fn allowed_tools(&self) -> Option<&BTreeSet<String>> {
        self.allowed_tools.as_ref()
    }

    /// Adds tools to the allowlist.
    pub fn union_allowed_tools<I>(&mut self, tools: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.allowed_tools
            .get_or_insert_with(BTreeSet::new)
            .extend(tools);
    }

    /// Returns `true` when no scope has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty() && self.allowed_tools.as_ref().is_none_or(BTreeSet::is_empty)
    }

    /// Returns `true` if the scope is effectively granted at `now`.
    #[must_use]
    pub fn allows(&self, scope: Scope, now: DateTime<Utc>) -> bool {
        self.grant(scope).is_some_and(|grant| grant.is_effective(now))
    }

    /// Returns `true` if `tool` may execute at `now`.
    #[must_use]
    pub fn allows_tool(&self, tool: &str, now: DateTime<Utc>) -> bool {
        if !self.allows(Scope::ToolsCall, now) {
            return false;
        }
        match &self.allowed_tools {
            Some(list) if !list.is_empty() => list.contains(tool),
            _ => true,
        }
    }
}

/// In-memory, TTL-bound grant bundle for one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryGrant {
    /// Origin the bundle belongs to.
    pub origin: Origin,
    /// Scopes granted for the lifetime of the bundle.
    pub scopes: BTreeSet<Scope>,
    /// Tool allowlist; replaces rather than extends the previous bundle's list.
    pub allowed_tools: Option<BTreeSet<String>>,
    /// When consent was given.
    pub granted_at: DateTime<Utc>,
    /// Absolute wall-clock deadline.
    pub expires_at: DateTime<Utc>,
    /// Tab the consent was given from, for scoped cleanup.
    pub tab_id: Option<TabId>,
}

impl TemporaryGrant {
    /// Returns `true` when the bundle is still live at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Extra inputs for a grant call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantOptions {
    /// Tools the origin may execute. `None` leaves the allowlist untouched for
    /// persistent grants and clears it for once-grants.
    pub allowed_tools: Option<Vec<String>>,
    /// Tab the consent came from.
    pub tab_id: Option<TabId>,
}

impl GrantOptions {
    /// Restricts execution to the listed tools.
    #[must_use]
    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Tags the grant with a tab.
    #[must_use]
    pub fn with_tab(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }
}

/// Caller-facing view of an origin's effective permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionStatus {
    /// Origin the status describes.
    pub origin: Origin,
    /// Effective status per recorded scope.
    pub scopes: BTreeMap<Scope, GrantStatus>,
    /// Effective tool allowlist, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

impl PermissionStatus {
    /// Builds the caller-facing view of a merged record at `now`.
    #[must_use]
    pub fn from_record(record: &OriginPermissionRecord, now: DateTime<Utc>) -> Self {
        let scopes = record
            .grants()
            .map(|(scope, grant)| (scope, grant.status_at(now)))
            .filter(|(_, status)| *status != GrantStatus::NotGranted)
            .collect();
        Self {
            origin: record.origin().clone(),
            scopes,
            allowed_tools: record
                .allowed_tools()
                .filter(|tools| !tools.is_empty())
                .map(|tools| tools.iter().cloned().collect()),
        }
    }
}

/// Computes the effective record for one origin.
///
/// A live temporary bundle overrides the persistent grant for every scope it
/// names and, when it carries an allowlist, the persistent allowlist too. An
/// expired bundle is ignored.
#[must_use]
pub fn merge_records(
    origin: &Origin,
    persistent: Option<&OriginPermissionRecord>,
    temporary: Option<&TemporaryGrant>,
    now: DateTime<Utc>,
) -> OriginPermissionRecord {
    let mut merged = persistent
        .cloned()
        .unwrap_or_else(|| OriginPermissionRecord::new(origin.clone()));

    if let Some(temp) = temporary.filter(|temp| temp.is_live(now)) {
        for scope in &temp.scopes {
            merged.set_grant(*scope, Grant::once(temp.granted_at, temp.expires_at));
        }
        if let Some(tools) = &temp.allowed_tools {
            merged.allowed_tools = Some(tools.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn origin() -> Origin {
        Origin::parse("https://app.example.com").unwrap()
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn once_grant_expires_at_exact_deadline() {
        let now = epoch();
        let deadline = now + TimeDelta::minutes(10);
        let grant = Grant::once(now, deadline);

        assert!(grant.is_effective(deadline - TimeDelta::milliseconds(1)));
        assert!(!grant.is_effective(deadline));
        assert_eq!(grant.status_at(deadline), GrantStatus::NotGranted);
    }

    #[test]
    fn temporary_overrides_persistent_scope() {
        let now = epoch();
        let mut persistent = OriginPermissionRecord::new(origin());
        persistent.set_grant(Scope::ToolsCall, Grant::denied(now));
        persistent.union_allowed_tools(["a/x".to_owned()]);

        let temp = TemporaryGrant {
            origin: origin(),
            scopes: [Scope::ToolsCall].into_iter().collect(),
            allowed_tools: Some(["b/y".to_owned()].into_iter().collect()),
            granted_at: now,
            expires_at: now + TimeDelta::minutes(1),
            tab_id: None,
        };

        let merged = merge_records(&origin(), Some(&persistent), Some(&temp), now);
        assert!(merged.allows(Scope::ToolsCall, now));
        assert!(merged.allows_tool("b/y", now));
        assert!(!merged.allows_tool("a/x", now));

        let later = now + TimeDelta::minutes(1);
        let merged = merge_records(&origin(), Some(&persistent), Some(&temp), later);
        assert!(!merged.allows(Scope::ToolsCall, later));
    }

    #[test]
    fn empty_allowlist_is_unrestricted() {
        let now = epoch();
        let mut record = OriginPermissionRecord::new(origin());
        assert!(!record.allows_tool("any/tool", now));

        record.set_grant(Scope::ToolsCall, Grant::always(now));
        record.union_allowed_tools(Vec::new());
        assert!(record.allows_tool("any/tool", now));
    }

    #[test]
    fn status_view_hides_expired_grants() {
        let now = epoch();
        let mut record = OriginPermissionRecord::new(origin());
        record.set_grant(Scope::ModelPrompt, Grant::always(now));
        record.set_grant(Scope::ToolsList, Grant::once(now, now + TimeDelta::seconds(1)));

        let status = PermissionStatus::from_record(&record, now + TimeDelta::seconds(2));
        assert_eq!(status.scopes.len(), 1);
        assert_eq!(
            status.scopes.get(&Scope::ModelPrompt),
            Some(&GrantStatus::GrantedAlways)
        );
        assert!(status.allowed_tools.is_none());
    }
}
