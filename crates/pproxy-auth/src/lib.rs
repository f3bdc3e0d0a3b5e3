mod error;
mod service;

pub use error::AuthError;
pub use service::{
    AuthService, CreatedApiKey, CreatedUser, Session, SessionClaims, SESSION_TTL,
};
