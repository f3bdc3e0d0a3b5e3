use std::path::Path;

use pproxy_common::DescriptorFile;

use crate::storage::{Storage, StorageResult};

/// One-time migration from text descriptors into the store.
///
/// Runs only while the model-record table is empty; afterwards the store is
/// the single source of truth and the descriptors are never consulted again.
/// Invalid descriptors and invalid records inside them are skipped with a
/// warning rather than failing startup.
pub async fn seed_from_dir(storage: &dyn Storage, dir: &Path) -> StorageResult<usize> {
    if storage.count_models().await? > 0 {
        return Ok(0);
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), "seed directory not readable: {err}");
            return Ok(0);
        }
    };

    let mut seeded = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_descriptor(&path) {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(file = %path.display(), "skipping unreadable descriptor: {err}");
                continue;
            }
        };
        let file: DescriptorFile = match serde_yaml::from_str(&raw) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(file = %path.display(), "skipping malformed descriptor: {err}");
                continue;
            }
        };
        for mut record in file.models {
            if let Err(err) = record.validate() {
                tracing::warn!(
                    file = %path.display(),
                    id = %record.id,
                    "skipping invalid model record: {err}"
                );
                continue;
            }
            match storage.insert_model(&record).await {
                Ok(_) => seeded += 1,
                Err(err) => {
                    tracing::warn!(id = %record.id, "seeding model record failed: {err}");
                }
            }
        }
    }

    Ok(seeded)
}

fn is_descriptor(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
