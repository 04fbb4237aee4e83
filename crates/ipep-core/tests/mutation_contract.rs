//! Architectural Contract Test: Client Mutations
//!
//! This test verifies create/modify/delete semantics on top of the
//! instance repository.
//!
//! Constraints verified:
//! - Key properties are immutable and a rejected modify changes nothing
//! - Retried requests return the prior outcome without a second effect
//! - Deletion hides an instance immediately and purges it later
//! - Concurrent modifies never lose an update
//!
//! If this test fails, someone has added:
//! - A partial apply of a rejected request, OR
//! - A mutation path that bypasses revision checks

mod common;

use common::*;
use ipep_core::error::Error;
use ipep_core::model::AdminStatus;
use ipep_core::mutation::Operation;
use ipep_core::properties::{self as props, ExternalInstance, PropertySet};
use ipep_core::traits::ManagementProvider;
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn create_retry_returns_prior_outcome() {
    // Arrange
    let host = ControlledHost::new(vec![]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let request = instance_name("dummy0").with(props::DESCRIPTION, "lab bridge");

    // Act
    let first = provider.create(&request).await.unwrap();
    let retry = provider.create(&request).await.unwrap();

    // Assert
    assert_eq!(first.operation, Operation::Create);
    assert_eq!(first.revision, 0);
    assert_eq!(first, retry, "a retried create must replay the first outcome");

    let entry = provider.repository().get(&key("dummy0")).await.unwrap();
    assert_eq!(entry.instance.revision, 0, "the retry must not apply again");
    assert_eq!(entry.instance.description.as_deref(), Some("lab bridge"));
}

#[tokio::test]
async fn modify_retry_returns_prior_outcome() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let request = ExternalInstance::new().with(props::DESCRIPTION, "uplink");

    // Act
    let first = provider
        .modify(&key("eth0"), &PropertySet::all(), &request)
        .await
        .unwrap();
    let retry = provider
        .modify(&key("eth0"), &PropertySet::all(), &request)
        .await
        .unwrap();

    // Assert
    assert_eq!(first.operation, Operation::Modify);
    assert_eq!(first.revision, 1);
    assert_eq!(first, retry, "a retried modify must replay the first outcome");
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(entry.instance.revision, 1, "the retry must not apply again");

    // A different payload is a new request
    let other = ExternalInstance::new().with(props::DESCRIPTION, "backbone");
    let next = provider
        .modify(&key("eth0"), &PropertySet::all(), &other)
        .await
        .unwrap();
    assert_eq!(next.revision, 2);
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(entry.instance.description.as_deref(), Some("backbone"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_creates_execute_once() {
    // Arrange
    let host = ControlledHost::new(vec![]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let provider = Arc::new(provider);

    // Act: the same create delivered eight times at once
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            let request = instance_name("dummy0").with(props::DESCRIPTION, "lab bridge");
            provider.create(&request).await
        }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().expect("every duplicate succeeds"));
    }

    // Assert
    assert!(outcomes.iter().all(|o| *o == outcomes[0]));
    assert_eq!(outcomes[0].revision, 0);
    let entry = provider.repository().get(&key("dummy0")).await.unwrap();
    assert_eq!(entry.instance.revision, 0);
}

#[tokio::test]
async fn create_on_live_key_already_exists() {
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    let result = provider
        .create(&instance_name("eth0").with(props::DESCRIPTION, "uplink"))
        .await;

    assert!(matches!(result, Err(Error::AlreadyExists(_))));
}

#[tokio::test]
async fn create_without_key_is_invalid() {
    let host = ControlledHost::new(vec![]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    let missing_name = ExternalInstance::new()
        .with(props::PROTOCOL_IF_TYPE, "IPv4")
        .with(props::DESCRIPTION, "nameless");
    let bad_protocol = ExternalInstance::new()
        .with(props::NAME, "eth0")
        .with(props::PROTOCOL_IF_TYPE, "IPX");

    assert!(matches!(provider.create(&missing_name).await, Err(Error::InvalidKey(_))));
    assert!(matches!(provider.create(&bad_protocol).await, Err(Error::InvalidKey(_))));
    assert!(provider.repository().is_empty().await);
}

#[tokio::test]
async fn key_change_rejects_whole_request() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let before = provider.repository().get(&key("eth0")).await.unwrap();

    // Act: a valid description alongside a renamed key
    let values = ExternalInstance::new()
        .with(props::NAME, "eth9")
        .with(props::DESCRIPTION, "renamed");
    let result = provider
        .modify(&key("eth0"), &PropertySet::all(), &values)
        .await;

    // Assert
    assert!(matches!(result, Err(Error::KeyImmutable(_))));
    let after = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(before.instance, after.instance, "nothing may be applied");
    assert!(matches!(
        provider.repository().get(&key("eth9")).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn invalid_value_rejects_whole_request() {
    let host = ControlledHost::new(vec![]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    provider.create(&instance_name("dummy0")).await.unwrap();

    // IPv6 address on an IPv4 endpoint, next to a valid description
    let values = ExternalInstance::new()
        .with(props::DESCRIPTION, "uplink")
        .with(props::IP_ADDRESS, "2001:db8::1");
    let result = provider
        .modify(&key("dummy0"), &PropertySet::all(), &values)
        .await;

    assert!(matches!(result, Err(Error::InvalidProperty(_))));
    let entry = provider.repository().get(&key("dummy0")).await.unwrap();
    assert_eq!(entry.instance.description, None);
    assert_eq!(entry.instance.revision, 0);
}

#[tokio::test]
async fn enabled_state_is_not_writable() {
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    // Current value is accepted as a no-op
    let same = ExternalInstance::new().with(props::ENABLED_STATE, 2);
    let outcome = provider
        .modify(&key("eth0"), &PropertySet::all(), &same)
        .await
        .unwrap();
    assert_eq!(outcome.revision, 0);

    let changed = ExternalInstance::new().with(props::ENABLED_STATE, 3);
    let result = provider
        .modify(&key("eth0"), &PropertySet::all(), &changed)
        .await;
    assert!(matches!(result, Err(Error::InvalidProperty(_))));
}

#[tokio::test]
async fn modify_touches_only_selected_properties() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    // Act: IPAddress is supplied but not in the property set
    let values = instance_name("eth0")
        .with(props::DESCRIPTION, "uplink")
        .with(props::IP_ADDRESS, "10.0.0.1");
    let outcome = provider
        .modify_instance(
            &instance_name("eth0"),
            &PropertySet::of([props::DESCRIPTION]),
            &values,
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(outcome.operation, Operation::Modify);
    assert_eq!(outcome.revision, 1);
    let current = provider
        .get_instance(&instance_name("eth0"), &PropertySet::all())
        .await
        .unwrap();
    assert_eq!(current.get_str(props::DESCRIPTION), Some("uplink"));
    assert_eq!(current.get_str(props::IP_ADDRESS), Some("192.168.1.10"));
}

#[tokio::test]
async fn revision_token_guards_against_stale_writes() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    // Act
    let first = provider
        .modify(
            &key("eth0"),
            &PropertySet::all(),
            &ExternalInstance::new()
                .with(props::DESCRIPTION, "first")
                .with(props::REVISION, 0),
        )
        .await;
    let stale = provider
        .modify(
            &key("eth0"),
            &PropertySet::all(),
            &ExternalInstance::new()
                .with(props::DESCRIPTION, "second")
                .with(props::REVISION, 0),
        )
        .await;

    // Assert
    assert_eq!(first.unwrap().revision, 1);
    assert!(matches!(stale, Err(Error::Conflict(_))));
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(entry.instance.description.as_deref(), Some("first"));
}

#[tokio::test]
async fn concurrent_modifies_with_same_token_admit_one() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let provider = Arc::new(provider);

    // Act
    let mut tasks = Vec::new();
    for i in 0..10 {
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            let values = ExternalInstance::new()
                .with(props::DESCRIPTION, format!("writer {}", i))
                .with(props::REVISION, 0);
            provider.modify(&key("eth0"), &PropertySet::all(), &values).await
        }));
    }
    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                winners += 1;
                assert_eq!(outcome.revision, 1);
            }
            Err(Error::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    // Assert
    assert_eq!(winners, 1);
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(entry.instance.revision, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_modifies_never_lose_updates() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let provider = Arc::new(provider);

    // Act: every writer retries on Conflict until it lands
    let mut tasks = Vec::new();
    for i in 0..20 {
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            let values = ExternalInstance::new().with(props::DESCRIPTION, format!("writer {}", i));
            loop {
                match provider.modify(&key("eth0"), &PropertySet::all(), &values).await {
                    Ok(outcome) => return outcome.revision,
                    Err(Error::Conflict(_)) => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }
    let mut revisions = BTreeSet::new();
    for task in tasks {
        revisions.insert(task.await.unwrap());
    }

    // Assert: 20 distinct revisions, one per accepted write
    assert_eq!(revisions.len(), 20);
    assert_eq!(revisions.iter().copied().collect::<Vec<_>>(), (1..=20).collect::<Vec<_>>());
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert_eq!(entry.instance.revision, 20);
}

#[tokio::test]
async fn deleted_instance_is_invisible_but_tracked() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;

    // Act
    let outcome = provider.delete_instance(&instance_name("eth0")).await.unwrap();

    // Assert
    assert_eq!(outcome.operation, Operation::Delete);
    assert_eq!(outcome.revision, 1);
    assert!(matches!(
        provider.get(&key("eth0"), &PropertySet::all()).await,
        Err(Error::NotFound(_))
    ));
    assert!(provider.enumerate(&PropertySet::all(), false, None).await.unwrap().is_empty());

    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert!(entry.is_deleted(), "the entry is kept as a stale tombstone");

    // A retried delete replays, other mutations see nothing
    assert_eq!(provider.delete(&key("eth0")).await.unwrap(), outcome);
    let modify = provider
        .modify(
            &key("eth0"),
            &PropertySet::all(),
            &ExternalInstance::new().with(props::DESCRIPTION, "gone"),
        )
        .await;
    assert!(matches!(modify, Err(Error::NotFound(_))));
    let job = provider
        .request_state_change(&key("eth0"), AdminStatus::Disabled, None)
        .await;
    assert!(matches!(job, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn deleted_instance_survives_scans_until_purged() {
    // Arrange: the host still reports eth0 after the delete
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let mut config = test_config();
    config.reconcile.purge_after = 2;
    let (provider, _event_rx) = load_provider(&host, config).await;
    provider.delete(&key("eth0")).await.unwrap();

    // Act & Assert
    provider.refresh().await.unwrap();
    assert!(provider.get(&key("eth0"), &PropertySet::all()).await.is_err());
    assert!(provider.repository().get(&key("eth0")).await.is_ok());

    provider.refresh().await.unwrap();
    assert!(matches!(
        provider.repository().get(&key("eth0")).await,
        Err(Error::NotFound(_))
    ));

    // The next scan rediscovers it as a new instance
    provider.refresh().await.unwrap();
    let entry = provider.repository().get(&key("eth0")).await.unwrap();
    assert!(!entry.is_stale());
    assert_eq!(entry.instance.revision, 0);
}

#[tokio::test]
async fn create_after_delete_revives_with_higher_revision() {
    // Arrange
    let host = ControlledHost::new(vec![ipv4_fact("eth0", AdminStatus::Enabled)]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    let request = instance_name("eth0").with(props::DESCRIPTION, "restored");

    // Act
    provider.delete(&key("eth0")).await.unwrap();
    let created = provider.create(&request).await.unwrap();

    // Assert
    assert_eq!(created.revision, 2);
    let current = provider.get(&key("eth0"), &PropertySet::all()).await.unwrap();
    assert_eq!(current.get_str(props::DESCRIPTION), Some("restored"));
    assert_eq!(current.get(props::REVISION).and_then(|v| v.as_u64()), Some(2));
}

#[tokio::test]
async fn created_instance_is_not_marked_missing() {
    // Arrange: dummy0 exists only because a client created it
    let host = ControlledHost::new(vec![]);
    let (provider, _event_rx) = load_provider(&host, test_config()).await;
    provider.create(&instance_name("dummy0")).await.unwrap();

    // Act
    for _ in 0..5 {
        provider.refresh().await.unwrap();
    }

    // Assert
    let entry = provider.repository().get(&key("dummy0")).await.unwrap();
    assert!(!entry.is_stale());
    assert!(provider.get(&key("dummy0"), &PropertySet::all()).await.is_ok());
}
