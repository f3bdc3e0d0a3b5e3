use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use time::{Duration, OffsetDateTime};

use pproxy_auth::{AuthError, AuthService};
use pproxy_storage::{SqlStorage, Storage};

async fn memory_storage() -> Arc<SqlStorage> {
    let storage = SqlStorage::connect("sqlite::memory:").await.unwrap();
    storage.sync().await.unwrap();
    Arc::new(storage)
}

async fn service(storage: Arc<SqlStorage>) -> AuthService {
    AuthService::bootstrap(storage).await.unwrap()
}

fn encrypt_for(service: &AuthService, password: &str) -> String {
    let pem = service.public_key_pem().unwrap();
    let public_key = RsaPublicKey::from_public_key_pem(&pem).unwrap();
    let ciphertext = public_key
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<sha2::Sha256>(),
            password.as_bytes(),
        )
        .unwrap();
    BASE64.encode(ciphertext)
}

#[tokio::test]
async fn register_is_first_install_only() {
    let auth = service(memory_storage().await).await;

    assert!(auth.is_first_install().await.unwrap());
    let session = auth.register("root", "secret").await.unwrap();
    assert!(session.user.is_admin);
    assert_eq!(session.user.created_by, 0);
    assert!(!auth.is_first_install().await.unwrap());

    let err = auth.register("second", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::InstallCompleted));
}

#[tokio::test]
async fn login_checks_password_and_enabled_flag() {
    let storage = memory_storage().await;
    let auth = service(storage.clone()).await;
    let session = auth.register("root", "secret").await.unwrap();

    assert!(matches!(
        auth.login("root", "wrong").await.unwrap_err(),
        AuthError::InvalidCredentials
    ));
    assert!(matches!(
        auth.login("ghost", "secret").await.unwrap_err(),
        AuthError::InvalidCredentials
    ));

    auth.login("root", "secret").await.unwrap();

    storage
        .set_user_enabled(session.user.id, false)
        .await
        .unwrap();
    assert!(matches!(
        auth.login("root", "secret").await.unwrap_err(),
        AuthError::AccountDisabled
    ));
}

#[tokio::test]
async fn tokens_survive_restart_envelopes_do_not() {
    let storage = memory_storage().await;
    let first = service(storage.clone()).await;
    let session = first.register("root", "secret").await.unwrap();
    let envelope = encrypt_for(&first, "secret");
    first.encrypted_login("root", &envelope).await.unwrap();

    // Same storage, fresh process: persisted secret validates old tokens,
    // but the ephemeral keypair rejects old envelopes.
    let second = service(storage).await;
    let claims = second.verify_token(&session.token).unwrap();
    assert_eq!(claims.username, "root");
    assert!(claims.is_admin);

    let err = second.encrypted_login("root", &envelope).await.unwrap_err();
    assert!(matches!(err, AuthError::BadEnvelope));
}

#[tokio::test]
async fn garbage_tokens_are_rejected() {
    let auth = service(memory_storage().await).await;
    assert!(matches!(
        auth.verify_token("not-a-token").unwrap_err(),
        AuthError::InvalidToken
    ));
}

#[tokio::test]
async fn encrypted_register_round_trips() {
    let auth = service(memory_storage().await).await;
    let envelope = encrypt_for(&auth, "hunter2!");
    auth.encrypted_register("root", &envelope).await.unwrap();
    auth.login("root", "hunter2!").await.unwrap();
}

#[tokio::test]
async fn created_users_get_a_working_one_time_password() {
    let auth = service(memory_storage().await).await;
    let admin = auth.register("root", "secret").await.unwrap();

    let created = auth
        .create_user("alice", false, admin.user.id)
        .await
        .unwrap();
    assert!(!created.user.is_admin);
    assert_eq!(created.user.created_by, admin.user.id);
    auth.login("alice", &created.generated_password)
        .await
        .unwrap();

    let err = auth
        .create_user("alice", false, admin.user.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::UsernameTaken));
}

#[tokio::test]
async fn bootstrap_admin_is_hidden_from_listing() {
    let auth = service(memory_storage().await).await;
    let admin = auth.register("root", "secret").await.unwrap();
    auth.create_user("alice", false, admin.user.id)
        .await
        .unwrap();

    let listed = auth.list_users().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].username, "alice");
}

#[tokio::test]
async fn self_delete_and_self_disable_are_rejected() {
    let auth = service(memory_storage().await).await;
    let admin = auth.register("root", "secret").await.unwrap();

    assert!(matches!(
        auth.delete_user(admin.user.id, admin.user.id).await.unwrap_err(),
        AuthError::SelfDeletion
    ));
    assert!(matches!(
        auth.set_user_status(admin.user.id, admin.user.id, false)
            .await
            .unwrap_err(),
        AuthError::SelfDisable
    ));
    // Re-enabling yourself is fine.
    auth.set_user_status(admin.user.id, admin.user.id, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn change_password_requires_old_password() {
    let auth = service(memory_storage().await).await;
    let session = auth.register("root", "secret").await.unwrap();

    assert!(matches!(
        auth.change_password(session.user.id, "nope", "next")
            .await
            .unwrap_err(),
        AuthError::WrongPassword
    ));
    auth.change_password(session.user.id, "secret", "next")
        .await
        .unwrap();
    auth.login("root", "next").await.unwrap();
}

#[tokio::test]
async fn api_key_lifecycle_gates_authorization() {
    let storage = memory_storage().await;
    let auth = service(storage.clone()).await;
    let admin = auth.register("root", "secret").await.unwrap();

    let created = auth
        .create_api_key(admin.user.id, "ci", None, None)
        .await
        .unwrap();
    assert!(created.row.key_value.starts_with("ak_"));

    let verified = auth.verify_api_key(&created.row.key_value).await.unwrap();
    assert_eq!(verified.user_id, admin.user.id);

    assert!(matches!(
        auth.verify_api_key("ak_unknown").await.unwrap_err(),
        AuthError::InvalidApiKey
    ));

    auth.set_api_key_status(admin.user.id, created.row.id, false)
        .await
        .unwrap();
    assert!(matches!(
        auth.verify_api_key(&created.row.key_value).await.unwrap_err(),
        AuthError::ApiKeyDisabled
    ));
    auth.set_api_key_status(admin.user.id, created.row.id, true)
        .await
        .unwrap();

    let expired = auth
        .create_api_key(
            admin.user.id,
            "expired",
            None,
            Some(OffsetDateTime::now_utc() - Duration::minutes(1)),
        )
        .await
        .unwrap();
    assert!(matches!(
        auth.verify_api_key(&expired.row.key_value).await.unwrap_err(),
        AuthError::ApiKeyExpired
    ));

    // Owner-scoped delete.
    auth.delete_api_key(admin.user.id, created.row.id)
        .await
        .unwrap();
    assert!(matches!(
        auth.verify_api_key(&created.row.key_value).await.unwrap_err(),
        AuthError::InvalidApiKey
    ));
}
