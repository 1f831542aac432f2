//! Integration tests for issue, rotate and revoke against a simulated database

mod common;

use common::{Harness, INITIAL_A, INITIAL_B, PASS_KEY, USER_KEY, scope};
use keyshift_rotation::{ErrorKind, RotationError, RotationStatus, SlotIndex};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_issue_sets_both_logins_and_publishes_slot_zero() {
    // GIVEN a registered configuration for svc_a / svc_b
    let harness = Harness::new().registered().await;

    // WHEN credentials are issued
    let config = harness.orchestrator.issue(&harness.id).await.unwrap();

    // THEN slot 0 is active and both logins have fresh, working passwords
    assert_eq!(config.status, RotationStatus::Active);
    assert_eq!(config.active_index, SlotIndex::Primary);
    assert!(config.last_rotated_at.is_some());

    let pw_a = harness.target.password_of("svc_a").unwrap();
    let pw_b = harness.target.password_of("svc_b").unwrap();
    assert_ne!(pw_a, INITIAL_A);
    assert_ne!(pw_b, INITIAL_B);
    assert_ne!(pw_a, pw_b);
    assert_eq!(pw_a.len(), 48);

    // one transaction for both logins
    assert_eq!(harness.target.commits(), 1);

    // AND the payload follows the mapping
    let (user, pass) = harness.published().unwrap();
    assert_eq!(user, "svc_a");
    assert_eq!(pass, pw_a);
    assert!(harness.secrets.get(&scope(), USER_KEY).is_some());
    assert!(harness.secrets.get(&scope(), PASS_KEY).is_some());
    assert_eq!(harness.target.live_sessions(), 0);
}

#[tokio::test]
async fn test_issue_failure_returns_to_pending_and_changes_nothing() {
    // GIVEN a target that rejects the password change
    let harness = Harness::new().registered().await;
    harness.target.fail_apply_echoing_statement(true);

    // WHEN issuing
    let err = harness.orchestrator.issue(&harness.id).await.unwrap_err();

    // THEN neither login changed and the configuration is pending again
    assert_eq!(err.kind(), ErrorKind::Apply);
    assert_eq!(harness.target.password_of("svc_a").as_deref(), Some(INITIAL_A));
    assert_eq!(harness.target.password_of("svc_b").as_deref(), Some(INITIAL_B));

    let stored = harness.stored().await;
    assert_eq!(stored.status, RotationStatus::Pending);
    assert_eq!(stored.last_error_kind, Some(ErrorKind::Apply));
    assert!(stored.status_message.is_some());
    assert!(harness.published().is_none());
}

#[tokio::test]
async fn test_issue_fails_when_a_login_does_not_verify() {
    // GIVEN a target that refuses logins as svc_b
    let harness = Harness::new().registered().await;
    harness.target.reject_login("svc_b");

    // WHEN issuing
    let err = harness.orchestrator.issue(&harness.id).await.unwrap_err();

    // THEN the failure is a validation error and nothing was published
    assert!(matches!(err, RotationError::Validation { ref username, .. } if username == "svc_b"));
    assert_eq!(harness.stored().await.status, RotationStatus::Pending);
    assert!(harness.published().is_none());
}

#[tokio::test]
async fn test_rotation_never_touches_the_active_login() {
    // GIVEN issued credentials; consumers hold svc_a's password
    let harness = Harness::new().issued().await;
    let (_, consumer_password) = harness.published().unwrap();

    // WHEN rotating
    let config = harness.orchestrator.rotate(&harness.id).await.unwrap();

    // THEN svc_b became active with a new password
    assert_eq!(config.active_index, SlotIndex::Secondary);
    assert_eq!(config.status, RotationStatus::Active);
    let (user, pass) = harness.published().unwrap();
    assert_eq!(user, "svc_b");
    assert!(harness.target.authenticate("svc_b", &pass));

    // AND the credential consumers already hold keeps working
    assert!(harness.target.authenticate("svc_a", &consumer_password));

    // WHEN rotating again
    let config = harness.orchestrator.rotate(&harness.id).await.unwrap();

    // THEN svc_a is replaced and svc_b's previous password still works
    assert_eq!(config.active_index, SlotIndex::Primary);
    assert!(harness.target.authenticate("svc_b", &pass));
    assert!(!harness.target.authenticate("svc_a", &consumer_password));
    assert!(harness.published_authenticates());
    assert_eq!(harness.target.live_sessions(), 0);
}

#[tokio::test]
async fn test_unreachable_target_leaves_active_slot_alone() {
    // GIVEN issued credentials
    let harness = Harness::new().issued().await;
    let before = harness.published().unwrap();

    // WHEN the target is unreachable during rotation
    harness.target.set_unreachable(true);
    let err = harness.orchestrator.rotate(&harness.id).await.unwrap_err();

    // THEN the error is a retryable connectivity failure
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.is_retryable());

    // AND the configuration is in error with slot 0 still active
    let stored = harness.stored().await;
    assert_eq!(stored.status, RotationStatus::Error);
    assert_eq!(stored.active_index, SlotIndex::Primary);
    assert_eq!(stored.last_error_kind, Some(ErrorKind::Connectivity));

    // AND the published credential is unchanged and still valid
    harness.target.set_unreachable(false);
    assert_eq!(harness.published().unwrap(), before);
    assert!(harness.published_authenticates());

    // WHEN the target comes back, rotation from error succeeds
    let config = harness.orchestrator.rotate(&harness.id).await.unwrap();
    assert_eq!(config.active_index, SlotIndex::Secondary);
    assert!(config.status_message.is_none());
}

#[tokio::test]
async fn test_failed_verification_does_not_flip_active_slot() {
    // GIVEN issued credentials and a standby login that stops authenticating
    let harness = Harness::new().issued().await;
    harness.target.reject_login("svc_b");

    // WHEN rotating
    let err = harness.orchestrator.rotate(&harness.id).await.unwrap_err();

    // THEN slot 0 stays active and published
    assert_eq!(err.kind(), ErrorKind::Validation);
    let stored = harness.stored().await;
    assert_eq!(stored.active_index, SlotIndex::Primary);
    assert_eq!(harness.published().unwrap().0, "svc_a");
    assert!(harness.published_authenticates());
}

#[tokio::test]
async fn test_publish_failure_keeps_previous_slot_active() {
    // GIVEN issued credentials and a secret store that fails once
    let harness = Harness::new().issued().await;
    let before = harness.published().unwrap();
    harness.secrets.fail_next_publishes(1);

    // WHEN rotating
    let err = harness.orchestrator.rotate(&harness.id).await.unwrap_err();

    // THEN the flip never happened
    assert_eq!(err.kind(), ErrorKind::Store);
    assert_eq!(harness.stored().await.active_index, SlotIndex::Primary);
    assert_eq!(harness.published().unwrap(), before);
    assert!(harness.published_authenticates());
}

#[tokio::test]
async fn test_transient_apply_failure_is_retried() {
    // GIVEN issued credentials and a target that hits one lock timeout
    let harness = Harness::new().issued().await;
    harness.target.fail_next_applies(1);

    // WHEN rotating with retry
    let config = harness.orchestrator.rotate_with_retry(&harness.id).await.unwrap();

    // THEN the second attempt succeeded
    assert_eq!(config.status, RotationStatus::Active);
    assert_eq!(config.active_index, SlotIndex::Secondary);
    assert!(harness.published_authenticates());
}

#[tokio::test]
async fn test_policy_error_is_not_retried() {
    // GIVEN a configuration whose template lost its password placeholder
    let harness = Harness::new().issued().await;
    let mut config = harness.stored().await;
    config.parameters["rotation_statement"] = serde_json::json!("ALTER USER {{username}}");
    keyshift_rotation::ConfigurationRepository::save(harness.repository.as_ref(), &config)
        .await
        .unwrap();
    let commits = harness.target.commits();

    // WHEN rotating with retry
    let err = harness.orchestrator.rotate_with_retry(&harness.id).await.unwrap_err();

    // THEN it failed once, fatally, without touching the target
    assert_eq!(err.kind(), ErrorKind::Policy);
    assert_eq!(harness.target.commits(), commits);
    assert_eq!(harness.stored().await.status, RotationStatus::Error);
}

#[tokio::test]
async fn test_revoke_invalidates_both_logins_and_removes_configuration() {
    // GIVEN issued credentials
    let harness = Harness::new().issued().await;
    let (_, published_password) = harness.published().unwrap();
    let pw_b = harness.target.password_of("svc_b").unwrap();

    // WHEN revoking
    harness.orchestrator.revoke(&harness.id).await.unwrap();

    // THEN neither previous password works, the logins still exist
    assert!(!harness.target.authenticate("svc_a", &published_password));
    assert!(!harness.target.authenticate("svc_b", &pw_b));
    assert!(harness.target.password_of("svc_a").is_some());
    assert!(harness.target.password_of("svc_b").is_some());

    // AND the configuration is gone
    assert!(harness.repository.is_empty());
    let err = harness.orchestrator.revoke(&harness.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_failed_revoke_can_be_repeated() {
    // GIVEN issued credentials and a target that fails the next two applies
    let harness = Harness::new().issued().await;
    harness.target.fail_next_applies(2);

    // WHEN revoking once
    let err = harness.orchestrator.revoke(&harness.id).await.unwrap_err();

    // THEN it is retryable and the configuration is in error
    assert!(err.is_retryable());
    assert_eq!(harness.stored().await.status, RotationStatus::Error);

    // WHEN revoking again with retry
    harness.orchestrator.revoke_with_retry(&harness.id).await.unwrap();

    // THEN the configuration is removed
    assert!(harness.repository.is_empty());
}

#[tokio::test]
async fn test_revoke_from_pending() {
    let harness = Harness::new().registered().await;

    harness.orchestrator.revoke(&harness.id).await.unwrap();

    assert!(!harness.target.authenticate("svc_a", INITIAL_A));
    assert!(!harness.target.authenticate("svc_b", INITIAL_B));
    assert!(harness.repository.is_empty());
}
