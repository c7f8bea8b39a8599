//! Domain types for global group memberships.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Substring that marks a group as a bot group.
pub const DEFAULT_BOT_MARKER: &str = "-bot";

// ============================================================================
// Identifiers
// ============================================================================

/// Stable user identifier. Never reused across distinct identities.
///
/// Ids `<= 0` denote anonymous users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// The id carried by unregistered users.
    pub const ANONYMOUS: UserId = UserId(0);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_anonymous(self) -> bool {
        self.0 <= 0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque group name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if the name contains `marker` (e.g. `-bot`).
    pub fn contains(&self, marker: &str) -> bool {
        self.0.contains(marker)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for GroupName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for GroupName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for GroupName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Users
// ============================================================================

/// The host's view of a user, as passed to hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    id: UserId,
    name: String,
}

impl User {
    /// A registered user with a database id.
    pub fn registered(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// An anonymous user (typically named after an IP address).
    pub fn anonymous(name: impl Into<String>) -> Self {
        Self {
            id: UserId::ANONYMOUS,
            name: name.into(),
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_registered(&self) -> bool {
        !self.id.is_anonymous()
    }
}

// ============================================================================
// Shard configuration
// ============================================================================

/// A database shard and the groups it is authoritative for.
///
/// `allowed_groups` is a whitelist: groups outside it are never taken from
/// this shard, even if its table contains them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareDescriptor {
    pub shard_id: String,
    pub allowed_groups: BTreeSet<GroupName>,
}

impl ShareDescriptor {
    pub fn new<I, G>(shard_id: impl Into<String>, allowed_groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        Self {
            shard_id: shard_id.into(),
            allowed_groups: allowed_groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, group: &GroupName) -> bool {
        self.allowed_groups.contains(group)
    }

    /// Query filter for `user` against this shard's whitelist.
    pub fn filter_for(&self, user: UserId) -> MembershipFilter {
        MembershipFilter {
            user,
            groups: self.allowed_groups.iter().cloned().collect(),
        }
    }
}

/// Statically pinned group assignments, applied without database access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinnedGroups(BTreeMap<GroupName, BTreeSet<UserId>>);

impl PinnedGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `users` into `group`, extending any existing assignment.
    pub fn pin<I>(&mut self, group: impl Into<GroupName>, users: I)
    where
        I: IntoIterator<Item = UserId>,
    {
        self.0.entry(group.into()).or_default().extend(users);
    }

    #[must_use]
    pub fn with(mut self, group: impl Into<GroupName>, users: &[i64]) -> Self {
        self.pin(group, users.iter().copied().map(UserId::new));
        self
    }

    /// Groups `user` is pinned into, in name order.
    pub fn groups_for(&self, user: UserId) -> impl Iterator<Item = &GroupName> {
        self.0
            .iter()
            .filter(move |(_, users)| users.contains(&user))
            .map(|(group, _)| group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupName, &BTreeSet<UserId>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Query filter handed to a [`crate::MembershipSource`].
///
/// Matches rows for `user` whose group is in `groups` and which have no
/// expiry or an expiry at or after the database's current time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipFilter {
    pub user: UserId,
    pub groups: Vec<GroupName>,
}

// ============================================================================
// Membership changes
// ============================================================================

/// A single group membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: GroupName,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub expiry: Option<OffsetDateTime>,
}

impl GroupMembership {
    pub fn permanent(group: impl Into<GroupName>) -> Self {
        Self {
            group: group.into(),
            expiry: None,
        }
    }

    pub fn expiring(group: impl Into<GroupName>, expiry: OffsetDateTime) -> Self {
        Self {
            group: group.into(),
            expiry: Some(expiry),
        }
    }

    /// Returns `true` if the membership is active at `now`.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_none_or(|expiry| expiry >= now)
    }
}

/// Who performed a membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Performer {
    /// A user acting through the host.
    User { user: User },
    /// Automatic promotion, no acting user.
    Autopromotion,
}

/// Notification that a user's group memberships were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub user: User,
    pub added: Vec<GroupName>,
    pub removed: Vec<GroupName>,
    pub performer: Performer,
    pub reason: Option<String>,
    pub old_memberships: Vec<GroupMembership>,
    pub new_memberships: Vec<GroupMembership>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl MembershipChange {
    /// A change with no groups added or removed yet, performed by autopromotion.
    pub fn new(user: User) -> Self {
        Self {
            user,
            added: Vec::new(),
            removed: Vec::new(),
            performer: Performer::Autopromotion,
            reason: None,
            old_memberships: Vec::new(),
            new_memberships: Vec::new(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn with_added(mut self, group: impl Into<GroupName>) -> Self {
        self.added.push(group.into());
        self
    }

    #[must_use]
    pub fn with_removed(mut self, group: impl Into<GroupName>) -> Self {
        self.removed.push(group.into());
        self
    }

    #[must_use]
    pub fn performed_by(mut self, performer: User) -> Self {
        self.performer = Performer::User { user: performer };
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_memberships(
        mut self,
        old: Vec<GroupMembership>,
        new: Vec<GroupMembership>,
    ) -> Self {
        self.old_memberships = old;
        self.new_memberships = new;
        self
    }

    pub fn user_id(&self) -> UserId {
        self.user.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_user_id_anonymous() {
        assert!(UserId::ANONYMOUS.is_anonymous());
        assert!(UserId::new(-1).is_anonymous());
        assert!(!UserId::new(42).is_anonymous());
        assert!(User::registered(42, "Alice").is_registered());
        assert!(!User::anonymous("127.0.0.1").is_registered());
    }

    #[test]
    fn test_group_name_marker() {
        assert!(GroupName::from("sysop-bot").contains(DEFAULT_BOT_MARKER));
        assert!(!GroupName::from("bot").contains(DEFAULT_BOT_MARKER));
    }

    #[test]
    fn test_share_descriptor_filter() {
        let share = ShareDescriptor::new("metawiki", ["sysop", "bot"]);
        assert!(share.allows(&"sysop".into()));
        assert!(!share.allows(&"translator".into()));

        let filter = share.filter_for(UserId::new(42));
        assert_eq!(filter.user, UserId::new(42));
        // BTreeSet order
        assert_eq!(filter.groups, vec![GroupName::from("bot"), "sysop".into()]);
    }

    #[test]
    fn test_pinned_groups_lookup() {
        let pinned = PinnedGroups::new()
            .with("steward", &[42, 7])
            .with("founder", &[1])
            .with("auditor", &[42]);

        let groups: Vec<&str> = pinned.groups_for(UserId::new(42)).map(|g| g.as_str()).collect();
        assert_eq!(groups, vec!["auditor", "steward"]);
        assert_eq!(pinned.groups_for(UserId::new(99)).count(), 0);
    }

    #[test]
    fn test_membership_expiry() {
        let now = OffsetDateTime::now_utc();
        assert!(GroupMembership::permanent("sysop").is_active_at(now));
        assert!(GroupMembership::expiring("sysop", now + Duration::hours(1)).is_active_at(now));
        assert!(GroupMembership::expiring("sysop", now).is_active_at(now));
        assert!(!GroupMembership::expiring("sysop", now - Duration::seconds(1)).is_active_at(now));
    }

    #[test]
    fn test_membership_change_serialization() {
        let change = MembershipChange::new(User::registered(42, "Alice"))
            .with_added("sysop")
            .performed_by(User::registered(1, "Admin"))
            .with_reason("vote passed");

        let json = serde_json::to_value(&change).expect("serialize");
        assert_eq!(json["added"], serde_json::json!(["sysop"]));
        assert_eq!(json["performer"]["type"], "user");

        let back: MembershipChange = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.user_id(), UserId::new(42));
        assert_eq!(back.reason.as_deref(), Some("vote passed"));
    }
}
