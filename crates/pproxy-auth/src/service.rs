use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use pproxy_storage::{ApiKeyRow, NewApiKey, NewUser, Storage, UserPatch, UserRow};

use crate::error::AuthError;

/// Session tokens are short-lived; the signing secret is persisted so they
/// keep validating across restarts.
pub const SESSION_TTL: Duration = Duration::hours(24);

const JWT_SECRET_KEY: &str = "jwt_secret";
const API_KEY_PREFIX: &str = "ak_";
const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*";
const GENERATED_PASSWORD_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: i64,
    pub username: String,
    pub is_admin: bool,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: i64,
    pub user: UserRow,
}

#[derive(Debug, Clone)]
pub struct CreatedUser {
    pub user: UserRow,
    /// Returned exactly once; only the bcrypt hash is stored.
    pub generated_password: String,
}

#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub row: ApiKeyRow,
}

/// Password-backed sessions plus long-lived proxy API keys.
///
/// The session-token secret is durable (loaded from metadata, generated on
/// first start); the password-envelope RSA keypair is ephemeral by design, so
/// envelopes never survive a restart even though session tokens do. Clients
/// are expected to re-fetch the public key when decryption starts failing.
pub struct AuthService {
    storage: Arc<dyn Storage>,
    jwt_secret: Vec<u8>,
    rsa_key: RsaPrivateKey,
}

impl AuthService {
    /// Load or create the signing secret and generate the process keypair.
    /// Failures here are fatal to startup.
    pub async fn bootstrap(storage: Arc<dyn Storage>) -> Result<Self, AuthError> {
        let jwt_secret = match storage.get_metadata(JWT_SECRET_KEY).await? {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|err| AuthError::Crypto(format!("stored signing secret: {err}")))?,
            None => {
                let mut secret = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                storage
                    .set_metadata(JWT_SECRET_KEY, &BASE64.encode(secret))
                    .await?;
                secret.to_vec()
            }
        };

        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(|err| AuthError::Crypto(format!("generate keypair: {err}")))?;

        Ok(Self {
            storage,
            jwt_secret,
            rsa_key,
        })
    }

    // ---- Sessions ----

    pub fn issue_token(&self, user: &UserRow) -> Result<(String, i64), AuthError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = (now + SESSION_TTL).unix_timestamp();
        let claims = SessionClaims {
            user_id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
            iat: now.unix_timestamp(),
            exp: expires_at,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|err| AuthError::Crypto(format!("sign session token: {err}")))?;
        Ok((token, expires_at))
    }

    /// Rejects tokens whose signature, signing method, or expiry does not
    /// check out.
    pub fn verify_token(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)
    }

    // ---- Password envelope ----

    pub fn public_key_pem(&self) -> Result<String, AuthError> {
        self.rsa_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| AuthError::Crypto(format!("encode public key: {err}")))
    }

    /// Base64 → RSA-OAEP(SHA-256) → UTF-8. Any failure is the client's
    /// problem (stale key, garbled payload), not ours.
    pub fn decrypt_password(&self, envelope: &str) -> Result<String, AuthError> {
        let ciphertext = BASE64.decode(envelope).map_err(|_| AuthError::BadEnvelope)?;
        let plaintext = self
            .rsa_key
            .decrypt(Oaep::new::<sha2::Sha256>(), &ciphertext)
            .map_err(|_| AuthError::BadEnvelope)?;
        String::from_utf8(plaintext).map_err(|_| AuthError::BadEnvelope)
    }

    // ---- Install & ordinary auth ----

    pub async fn is_first_install(&self) -> Result<bool, AuthError> {
        Ok(self.storage.count_users().await? == 0)
    }

    /// Open only while no account exists; the first account becomes the
    /// bootstrap admin.
    pub async fn register(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        if !self.is_first_install().await? {
            return Err(AuthError::InstallCompleted);
        }
        let user = self
            .storage
            .insert_user(NewUser {
                username: username.to_string(),
                password_hash: hash_password(password)?,
                is_admin: true,
                is_enabled: true,
                created_by: 0,
            })
            .await?;
        self.session_for(user)
    }

    pub async fn encrypted_register(
        &self,
        username: &str,
        envelope: &str,
    ) -> Result<Session, AuthError> {
        let password = self.decrypt_password(envelope)?;
        self.register(username, &password).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let user = self
            .storage
            .find_user_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if !user.is_enabled {
            return Err(AuthError::AccountDisabled);
        }
        if !verify_password(password, &user.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        // Best-effort stamp; never fails the login.
        let storage = self.storage.clone();
        let user_id = user.id;
        tokio::spawn(async move {
            if let Err(err) = storage.touch_user_login(user_id).await {
                tracing::warn!(user_id, "updating last login time failed: {err}");
            }
        });

        self.session_for(user)
    }

    pub async fn encrypted_login(
        &self,
        username: &str,
        envelope: &str,
    ) -> Result<Session, AuthError> {
        let password = self.decrypt_password(envelope)?;
        self.login(username, &password).await
    }

    fn session_for(&self, user: UserRow) -> Result<Session, AuthError> {
        let (token, expires_at) = self.issue_token(&user)?;
        Ok(Session {
            token,
            expires_at,
            user,
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<UserRow, AuthError> {
        Ok(self.storage.get_user_by_id(id).await?)
    }

    // ---- User administration ----

    /// All accounts except the bootstrap admin, newest first.
    pub async fn list_users(&self) -> Result<Vec<UserRow>, AuthError> {
        let users = self.storage.list_users().await?;
        Ok(users.into_iter().filter(|u| u.created_by != 0).collect())
    }

    pub async fn create_user(
        &self,
        username: &str,
        is_admin: bool,
        creator_id: i64,
    ) -> Result<CreatedUser, AuthError> {
        if self
            .storage
            .find_user_by_username(username)
            .await?
            .is_some()
        {
            return Err(AuthError::UsernameTaken);
        }
        let generated_password = generate_password();
        let user = self
            .storage
            .insert_user(NewUser {
                username: username.to_string(),
                password_hash: hash_password(&generated_password)?,
                is_admin,
                is_enabled: true,
                created_by: creator_id,
            })
            .await?;
        Ok(CreatedUser {
            user,
            generated_password,
        })
    }

    pub async fn update_user(&self, id: i64, patch: UserPatch) -> Result<UserRow, AuthError> {
        Ok(self.storage.update_user(id, patch).await?)
    }

    pub async fn delete_user(&self, actor_id: i64, user_id: i64) -> Result<(), AuthError> {
        if actor_id == user_id {
            return Err(AuthError::SelfDeletion);
        }
        Ok(self.storage.delete_user(user_id).await?)
    }

    pub async fn set_user_status(
        &self,
        actor_id: i64,
        user_id: i64,
        enabled: bool,
    ) -> Result<(), AuthError> {
        if actor_id == user_id && !enabled {
            return Err(AuthError::SelfDisable);
        }
        Ok(self.storage.set_user_enabled(user_id, enabled).await?)
    }

    pub async fn change_password(
        &self,
        user_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self.storage.get_user_by_id(user_id).await?;
        if !verify_password(old_password, &user.password_hash) {
            return Err(AuthError::WrongPassword);
        }
        Ok(self
            .storage
            .update_user_password(user_id, &hash_password(new_password)?)
            .await?)
    }

    pub async fn reset_password(&self, user_id: i64, new_password: &str) -> Result<(), AuthError> {
        // Existence check keeps the error a 404 instead of a silent no-op.
        self.storage.get_user_by_id(user_id).await?;
        Ok(self
            .storage
            .update_user_password(user_id, &hash_password(new_password)?)
            .await?)
    }

    // ---- API keys ----

    pub async fn create_api_key(
        &self,
        user_id: i64,
        name: &str,
        key_value: Option<String>,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<CreatedApiKey, AuthError> {
        let key_value = key_value
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(generate_api_key);
        let row = self
            .storage
            .insert_api_key(NewApiKey {
                user_id,
                name: name.to_string(),
                key_value,
                expires_at,
            })
            .await?;
        Ok(CreatedApiKey { row })
    }

    pub async fn list_api_keys(&self, user_id: i64) -> Result<Vec<ApiKeyRow>, AuthError> {
        Ok(self.storage.list_api_keys(user_id).await?)
    }

    pub async fn set_api_key_status(
        &self,
        user_id: i64,
        key_id: i64,
        enabled: bool,
    ) -> Result<(), AuthError> {
        Ok(self
            .storage
            .set_api_key_enabled(key_id, user_id, enabled)
            .await?)
    }

    pub async fn delete_api_key(&self, user_id: i64, key_id: i64) -> Result<(), AuthError> {
        Ok(self.storage.delete_api_key(key_id, user_id).await?)
    }

    /// Authorize a proxy request. Disabled and expired keys never come back
    /// to the caller; `last_used_at` is refreshed off the request path.
    pub async fn verify_api_key(&self, key_value: &str) -> Result<ApiKeyRow, AuthError> {
        let key = self
            .storage
            .find_api_key_by_value(key_value)
            .await?
            .ok_or(AuthError::InvalidApiKey)?;
        if !key.is_enabled {
            return Err(AuthError::ApiKeyDisabled);
        }
        if let Some(expires_at) = key.expires_at
            && expires_at <= OffsetDateTime::now_utc()
        {
            return Err(AuthError::ApiKeyExpired);
        }

        let storage = self.storage.clone();
        let value = key.key_value.clone();
        tokio::spawn(async move {
            if let Err(err) = storage.touch_api_key_used(&value).await {
                tracing::warn!("updating api key last-used time failed: {err}");
            }
        });

        Ok(key)
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|err| AuthError::Crypto(format!("hash password: {err}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(GENERATED_PASSWORD_LEN);
    for _ in 0..GENERATED_PASSWORD_LEN {
        let idx = (rng.next_u32() as usize) % PASSWORD_CHARSET.len();
        out.push(PASSWORD_CHARSET[idx] as char);
    }
    out
}

/// High-entropy opaque token: recognizable prefix + hex of 32 random bytes.
fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(API_KEY_PREFIX.len() + bytes.len() * 2);
    out.push_str(API_KEY_PREFIX);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
