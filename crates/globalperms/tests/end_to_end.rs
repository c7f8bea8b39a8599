//! End-to-end behavior of global permissions over the in-memory membership
//! source and the local cache store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use globalperms::{GlobalPermissions, PermissionsConfig, PinnedConfig, ShardConfig, SourceKind};
use globalperms_cache::CacheConfig;
use globalperms_core::{GroupMembership, GroupName, HookRegistry, User, UserId};
use globalperms_db_memory::InMemoryMembershipStore;
use time::OffsetDateTime;

const META: &str = "metawiki";
const COMMONS: &str = "commonswiki";

fn permissions_config() -> PermissionsConfig {
    PermissionsConfig {
        source: SourceKind::Memory,
        shards: vec![
            ShardConfig {
                id: META.into(),
                allow: vec!["sysop".into(), "bot".into(), "sysop-bot".into()],
            },
            ShardConfig {
                id: COMMONS.into(),
                allow: vec!["translator".into()],
            },
        ],
        pinned: vec![PinnedConfig::new("steward", [42])],
        local_shard: META.into(),
        ..PermissionsConfig::default()
    }
}

fn alice() -> User {
    User::registered(42, "Alice")
}

struct Fixture {
    store: Arc<InMemoryMembershipStore>,
    permissions: GlobalPermissions,
    registry: HookRegistry,
}

async fn fixture_with(cache: CacheConfig) -> Fixture {
    let store = Arc::new(
        InMemoryMembershipStore::new()
            .with_shard(META)
            .with_shard(COMMONS),
    );
    store
        .add_membership(META, &alice(), GroupMembership::permanent("sysop"))
        .await
        .expect("seed sysop");
    store
        .add_membership(COMMONS, &alice(), GroupMembership::permanent("translator"))
        .await
        .expect("seed translator");
    store.reset_query_count();

    let permissions = GlobalPermissions::builder(permissions_config())
        .source(store.clone())
        .cache_config(cache)
        .build()
        .expect("build");

    let registry = HookRegistry::new();
    permissions.register_hooks(&registry).await;

    Fixture {
        store,
        permissions,
        registry,
    }
}

async fn fixture() -> Fixture {
    fixture_with(CacheConfig::default()).await
}

fn names(groups: &[GroupName]) -> Vec<&str> {
    groups.iter().map(GroupName::as_str).collect()
}

#[tokio::test]
async fn test_bot_group_appears_after_invalidation() {
    let f = fixture().await;

    let before = f.permissions.resolve_groups(UserId::new(42)).await;
    assert_eq!(names(&before.groups), vec!["steward", "sysop", "translator"]);
    assert!(!f.permissions.is_bot(&alice()).await.expect("is_bot"));

    let change = f
        .store
        .add_membership(META, &alice(), GroupMembership::permanent("sysop-bot"))
        .await
        .expect("grant sysop-bot")
        .performed_by(User::registered(1, "Steward"))
        .with_reason("approved bot flag");
    f.registry.dispatch_user_groups_changed(&change).await;

    let after = f.permissions.resolve_groups(UserId::new(42)).await;
    assert_eq!(
        names(&after.groups),
        vec!["steward", "sysop", "sysop-bot", "translator"]
    );
    assert!(f.permissions.is_bot(&alice()).await.expect("is_bot"));
}

#[tokio::test]
async fn test_without_invalidation_cached_groups_are_served() {
    let f = fixture().await;
    f.permissions.resolve_groups(UserId::new(42)).await;

    f.store
        .add_membership(META, &alice(), GroupMembership::permanent("sysop-bot"))
        .await
        .expect("grant");

    let cached = f.permissions.resolve_groups(UserId::new(42)).await;
    assert!(!cached.contains("sysop-bot"));
}

#[tokio::test]
async fn test_fresh_window_is_stable_and_query_free() {
    let f = fixture().await;

    let first = f.permissions.groups_for_user(&alice()).await;
    let queries = f.store.query_count();
    let second = f.permissions.groups_for_user(&alice()).await;

    assert_eq!(first, second);
    assert_eq!(f.store.query_count(), queries);
}

#[tokio::test]
async fn test_pinned_group_survives_total_outage() {
    let f = fixture().await;
    f.store.set_available(META, false).await;
    f.store.set_available(COMMONS, false).await;

    let mut groups = BTreeSet::from([GroupName::from("user")]);
    let err = f
        .permissions
        .effective_groups(&alice(), &mut groups)
        .await
        .expect_err("shards down");

    assert!(err.is_partial());
    assert!(groups.contains(&GroupName::from("steward")));
    assert!(groups.contains(&GroupName::from("user")));
}

#[tokio::test]
async fn test_shard_never_contributes_outside_whitelist() {
    let f = fixture().await;
    // translator is only authoritative on commonswiki
    f.store
        .add_membership(META, &alice(), GroupMembership::permanent("translator"))
        .await
        .expect("grant");
    f.store
        .add_membership(COMMONS, &alice(), GroupMembership::permanent("sysop"))
        .await
        .expect("grant");
    f.store
        .remove_membership(COMMONS, &alice(), &GroupName::from("translator"))
        .await
        .expect("revoke");

    let resolution = f.permissions.resolve_groups(UserId::new(42)).await;
    assert_eq!(names(&resolution.groups), vec!["steward", "sysop"]);
}

#[tokio::test]
async fn test_invalidation_is_idempotent() {
    let f = fixture().await;
    f.permissions.resolve_groups(UserId::new(42)).await;

    let change = f
        .store
        .remove_membership(META, &alice(), &GroupName::from("sysop"))
        .await
        .expect("revoke")
        .expect("was a member");
    f.permissions.on_membership_changed(&change).await;
    f.permissions.on_membership_changed(&change).await;
    f.store.reset_query_count();

    let resolution = f.permissions.resolve_groups(UserId::new(42)).await;
    assert_eq!(names(&resolution.groups), vec!["steward", "translator"]);
    // Only the local shard's entry was dropped
    assert_eq!(f.store.query_count_for(META), 1);
    assert_eq!(f.store.query_count_for(COMMONS), 0);
}

#[tokio::test]
async fn test_concurrent_callers_on_expired_key_refill_once() {
    let f = fixture_with(CacheConfig {
        fresh_ttl_secs: 1,
        ..CacheConfig::default()
    })
    .await;
    let permissions = Arc::new(f.permissions);

    permissions.resolve_groups(UserId::new(42)).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    f.store.reset_query_count();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let permissions = Arc::clone(&permissions);
        handles.push(tokio::spawn(async move {
            permissions.resolve_groups(UserId::new(42)).await
        }));
    }

    for handle in handles {
        let resolution = handle.await.expect("join");
        assert!(resolution.is_complete());
        assert_eq!(names(&resolution.groups), vec!["steward", "sysop", "translator"]);
    }
    assert_eq!(f.store.query_count_for(META), 1);
    assert_eq!(f.store.query_count_for(COMMONS), 1);
}

#[tokio::test]
async fn test_expired_membership_is_excluded() {
    let f = fixture().await;
    let yesterday = OffsetDateTime::now_utc() - time::Duration::days(1);
    f.store
        .add_membership(META, &alice(), GroupMembership::expiring("sysop", yesterday))
        .await
        .expect("expire sysop");

    let resolution = f.permissions.resolve_groups(UserId::new(42)).await;
    assert_eq!(names(&resolution.groups), vec!["steward", "translator"]);
}

#[tokio::test]
async fn test_anonymous_user_is_ignored() {
    let f = fixture().await;

    let mut groups = BTreeSet::from([GroupName::from("*")]);
    f.permissions
        .effective_groups(&User::anonymous("192.0.2.1"), &mut groups)
        .await
        .expect("no-op");

    assert_eq!(groups.len(), 1);
    assert!(!f.permissions.is_bot(&User::anonymous("192.0.2.1")).await.expect("no-op"));
    assert_eq!(f.store.query_count(), 0);
}

#[tokio::test]
async fn test_registry_effective_groups_and_is_bot() {
    let f = fixture().await;

    let mut groups = BTreeSet::new();
    f.registry
        .run_effective_groups(&alice(), &mut groups)
        .await
        .expect("effective groups");
    assert_eq!(groups.len(), 3);

    assert!(!f.registry.run_is_bot(&alice()).await.expect("is_bot"));
}
