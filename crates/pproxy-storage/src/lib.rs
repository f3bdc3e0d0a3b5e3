pub mod entities;
pub mod seaorm;
pub mod seed;
pub mod snapshot;
pub mod storage;

pub use seaorm::SqlStorage;
pub use seed::seed_from_dir;
pub use snapshot::{ApiKeyRow, ModelRow, StorageSnapshot, UserRow};
pub use storage::{NewApiKey, NewUser, Storage, StorageError, StorageResult, UserPatch};
