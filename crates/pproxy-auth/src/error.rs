use pproxy_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account is disabled")]
    AccountDisabled,
    #[error("system is already installed, registration is closed")]
    InstallCompleted,
    #[error("username already exists")]
    UsernameTaken,
    #[error("old password is incorrect")]
    WrongPassword,
    #[error("cannot delete your own account")]
    SelfDeletion,
    #[error("cannot disable your own account")]
    SelfDisable,
    #[error("invalid session token")]
    InvalidToken,
    #[error("password envelope could not be decrypted")]
    BadEnvelope,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("API key is disabled")]
    ApiKeyDisabled,
    #[error("API key has expired")]
    ApiKeyExpired,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("credential operation failed: {0}")]
    Crypto(String),
}
