// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Secret store integration tests: round trips, env import/export,
//! rotation, masking and container injection.

mod support;

use std::sync::Arc;

use support::MockDriver;
use termflux_core::application::secret_service::{SecretService, SECRETS_FILE};
use termflux_core::domain::repository::SecretRepository;
use termflux_core::domain::workspace::WorkspaceId;
use termflux_core::infrastructure::crypto::{EnvelopeCipher, MasterKey};
use termflux_core::infrastructure::repositories::InMemorySecretRepository;

struct Harness {
    service: SecretService,
    repository: Arc<InMemorySecretRepository>,
    driver: Arc<MockDriver>,
    workspace_id: WorkspaceId,
}

fn harness() -> Harness {
    let repository = Arc::new(InMemorySecretRepository::new());
    let driver = Arc::new(MockDriver::new());
    let cipher = EnvelopeCipher::new(MasterKey::new("integration-test-master-key").unwrap());
    let service = SecretService::new(repository.clone(), cipher, driver.clone());
    Harness {
        service,
        repository,
        driver,
        workspace_id: WorkspaceId::new(),
    }
}

#[tokio::test]
async fn set_get_round_trip() {
    let h = harness();
    h.service
        .set(h.workspace_id, "API_KEY", "s3cret!")
        .await
        .unwrap();
    assert_eq!(
        h.service.get(h.workspace_id, "API_KEY").await.unwrap(),
        Some("s3cret!".to_string())
    );
    assert_eq!(h.service.get(h.workspace_id, "MISSING").await.unwrap(), None);
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let h = harness();
    for bad in ["lower", "2START", "WITH-DASH", ""] {
        assert!(h.service.set(h.workspace_id, bad, "v").await.is_err());
    }
}

#[tokio::test]
async fn list_returns_metadata_without_plaintext() {
    let h = harness();
    h.service
        .set(h.workspace_id, "API_KEY", "s3cret!")
        .await
        .unwrap();

    let listing = h.service.list(h.workspace_id).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "API_KEY");

    let as_json = serde_json::to_string(&listing).unwrap();
    assert!(!as_json.contains("s3cret!"));
}

#[tokio::test]
async fn delete_reports_whether_a_row_existed() {
    let h = harness();
    h.service.set(h.workspace_id, "GONE", "x").await.unwrap();
    assert!(h.service.delete(h.workspace_id, "GONE").await.unwrap());
    assert!(!h.service.delete(h.workspace_id, "GONE").await.unwrap());
}

#[tokio::test]
async fn create_only_conflicts_on_existing_name() {
    let h = harness();
    h.service
        .create(h.workspace_id, "UNIQUE", "first")
        .await
        .unwrap();
    let err = h
        .service
        .create(h.workspace_id, "UNIQUE", "second")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("conflict"));
    assert_eq!(
        h.service.get(h.workspace_id, "UNIQUE").await.unwrap(),
        Some("first".to_string())
    );
}

#[tokio::test]
async fn import_env_parses_quotes_comments_and_blanks() {
    let h = harness();
    let names = h
        .service
        .import_env(
            h.workspace_id,
            "# comment\n\nAPI_KEY='s3cret!'\nPLAIN=value\nQUOTED=\"a b\"\n",
        )
        .await
        .unwrap();

    assert_eq!(names, vec!["API_KEY", "PLAIN", "QUOTED"]);
    assert_eq!(
        h.service.get(h.workspace_id, "QUOTED").await.unwrap(),
        Some("a b".to_string())
    );
}

#[tokio::test]
async fn import_env_rejects_malformed_names() {
    let h = harness();
    assert!(h
        .service
        .import_env(h.workspace_id, "bad-name=x\n")
        .await
        .is_err());
}

#[tokio::test]
async fn export_then_import_is_an_identity_on_names_and_values() {
    let h = harness();
    h.service
        .set(h.workspace_id, "API_KEY", "s3cret!")
        .await
        .unwrap();
    h.service
        .set(h.workspace_id, "SPACED", "a b c")
        .await
        .unwrap();
    h.service
        .set(h.workspace_id, "DOLLAR", "$HOME/bin")
        .await
        .unwrap();

    let exported = h.service.export_env(h.workspace_id).await.unwrap();

    let other = harness();
    let names = other
        .service
        .import_env(other.workspace_id, &exported)
        .await
        .unwrap();
    assert_eq!(names.len(), 3);
    for name in ["API_KEY", "SPACED", "DOLLAR"] {
        assert_eq!(
            other.service.get(other.workspace_id, name).await.unwrap(),
            h.service.get(h.workspace_id, name).await.unwrap(),
        );
    }
}

#[tokio::test]
async fn rotate_rewrites_envelopes_and_preserves_values() {
    let h = harness();
    h.service
        .set(h.workspace_id, "API_KEY", "s3cret!")
        .await
        .unwrap();
    let before = h
        .repository
        .find_by_name(h.workspace_id, "API_KEY")
        .await
        .unwrap()
        .unwrap();

    let rotated = h.service.rotate(h.workspace_id).await.unwrap();
    assert_eq!(rotated, 1);

    let after = h
        .repository
        .find_by_name(h.workspace_id, "API_KEY")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(before.envelope, after.envelope);
    assert_eq!(
        h.service.get(h.workspace_id, "API_KEY").await.unwrap(),
        Some("s3cret!".to_string())
    );
}

#[tokio::test]
async fn mask_replaces_long_secret_values_only() {
    let h = harness();
    h.service
        .set(h.workspace_id, "TOKEN", "supersecret")
        .await
        .unwrap();
    h.service.set(h.workspace_id, "TINY", "ab").await.unwrap();

    let masked = h
        .service
        .mask_in_text(h.workspace_id, "token=supersecret tiny=ab")
        .await
        .unwrap();
    assert_eq!(masked, "token=******** tiny=ab");
}

#[tokio::test]
async fn corrupted_secret_is_fatal_for_that_secret_only() {
    let h = harness();
    h.service
        .set(h.workspace_id, "GOOD", "good-value")
        .await
        .unwrap();
    h.service.set(h.workspace_id, "BAD", "doomed").await.unwrap();

    // Corrupt one envelope in place.
    let mut bad = h
        .repository
        .find_by_name(h.workspace_id, "BAD")
        .await
        .unwrap()
        .unwrap();
    bad.envelope.ct_b64 = "AAAAAAAA".to_string();
    h.repository.save(&bad).await.unwrap();

    // The corrupt secret itself still fails loudly.
    assert!(h.service.get(h.workspace_id, "BAD").await.is_err());

    // Its siblings keep working across every batch operation.
    let exported = h.service.export_env(h.workspace_id).await.unwrap();
    assert!(exported.contains("GOOD=good-value"));
    assert!(!exported.contains("BAD"));

    let masked = h
        .service
        .mask_in_text(h.workspace_id, "see good-value here")
        .await
        .unwrap();
    assert_eq!(masked, "see ******** here");

    h.service.inject(h.workspace_id).await.unwrap();
    let commands = h.driver.commands();
    let script = commands
        .iter()
        .find(|c| c.contains(SECRETS_FILE))
        .expect("injection script was not executed");
    assert!(script.contains("export GOOD='good-value'"));
    assert!(!script.contains("export BAD"));
}

#[tokio::test]
async fn rotate_skips_corrupt_secrets_and_rotates_the_rest() {
    let h = harness();
    h.service
        .set(h.workspace_id, "GOOD", "good-value")
        .await
        .unwrap();
    h.service.set(h.workspace_id, "BAD", "doomed").await.unwrap();

    let mut bad = h
        .repository
        .find_by_name(h.workspace_id, "BAD")
        .await
        .unwrap()
        .unwrap();
    bad.envelope.ct_b64 = "AAAAAAAA".to_string();
    h.repository.save(&bad).await.unwrap();
    let corrupt_envelope = bad.envelope.clone();

    let rotated = h.service.rotate(h.workspace_id).await.unwrap();
    assert_eq!(rotated, 1);

    // The healthy secret got a fresh envelope and still round-trips.
    assert_eq!(
        h.service.get(h.workspace_id, "GOOD").await.unwrap(),
        Some("good-value".to_string())
    );

    // The corrupt one was left exactly as it was.
    let after = h
        .repository
        .find_by_name(h.workspace_id, "BAD")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.envelope, corrupt_envelope);
}

#[tokio::test]
async fn inject_writes_quoted_exports_and_bashrc_sentinel() {
    let h = harness();
    h.service
        .set(h.workspace_id, "API_KEY", "it's secret")
        .await
        .unwrap();

    h.service.inject(h.workspace_id).await.unwrap();

    let commands = h.driver.commands();
    let script = commands
        .iter()
        .find(|c| c.contains(SECRETS_FILE))
        .expect("injection script was not executed");
    assert!(script.contains("export API_KEY='it'\\''s secret'"));
    assert!(script.contains("chmod 600"));
    assert!(script.contains("# termflux secrets"));
    assert!(script.contains(".bashrc"));
}
