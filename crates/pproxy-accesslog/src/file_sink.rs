use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::AccessLogError;

const DEFAULT_READ_LIMIT: u64 = 1024 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatePeriod {
    Hour,
    #[default]
    Day,
}

impl RotatePeriod {
    fn stamp(self, now: OffsetDateTime) -> String {
        match self {
            RotatePeriod::Hour => now
                .format(&format_description!("[year][month][day][hour]"))
                .unwrap_or_default(),
            RotatePeriod::Day => now
                .format(&format_description!("[year][month][day]"))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub dir: PathBuf,
    /// Base file name; a trailing `.log` is tolerated and stripped.
    pub file: String,
    #[serde(default)]
    pub period: RotatePeriod,
    /// Retention in days; zero or negative disables the sweeper.
    #[serde(default)]
    pub expire_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    pub is_current: bool,
}

struct SinkState {
    file: Option<File>,
    current_stamp: String,
}

/// Append-only log file with period-based rotation and time-bounded
/// retention. Writes serialize behind the state mutex and are fsynced before
/// the lock is released, so a crash loses at most the in-flight record.
pub struct FileSink {
    config: FileSinkConfig,
    base: String,
    state: Mutex<SinkState>,
    closed: AtomicBool,
}

impl FileSink {
    /// Open the sink and start the hourly retention sweeper. The sweeper
    /// holds only a weak reference and stops once the sink is dropped.
    pub fn open(config: FileSinkConfig) -> Result<Arc<Self>, AccessLogError> {
        fs::create_dir_all(&config.dir)?;
        let base = config.file.trim_end_matches(".log").to_string();
        let sink = Arc::new(Self {
            config,
            base,
            state: Mutex::new(SinkState {
                file: None,
                current_stamp: String::new(),
            }),
            closed: AtomicBool::new(false),
        });
        {
            let mut state = sink.lock_state();
            sink.rotate_locked(&mut state)?;
        }

        let weak: Weak<FileSink> = Arc::downgrade(&sink);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sink) = weak.upgrade() else {
                    break;
                };
                if sink.closed.load(Ordering::Relaxed) {
                    break;
                }
                sink.sweep_expired();
            }
        });

        Ok(sink)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), AccessLogError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AccessLogError::Closed);
        }
        let mut state = self.lock_state();
        let stamp = self.config.period.stamp(OffsetDateTime::now_utc());
        if state.current_stamp != stamp {
            self.rotate_locked(&mut state)?;
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(data)?;
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut state = self.lock_state();
        state.file = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SinkState> {
        // A poisoned lock only means a panic mid-write; the state itself
        // stays usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_name(&self) -> String {
        format!("{}.log", self.base)
    }

    fn rotate_locked(&self, state: &mut SinkState) -> Result<(), AccessLogError> {
        let new_stamp = self.config.period.stamp(OffsetDateTime::now_utc());
        if let Some(file) = state.file.take() {
            drop(file);
            let old_path = self.config.dir.join(self.current_name());
            let archived = self
                .config
                .dir
                .join(format!("{}-{}.log", self.base, state.current_stamp));
            if old_path.exists() && !state.current_stamp.is_empty() && state.current_stamp != new_stamp
            {
                if let Err(err) = fs::rename(&old_path, &archived) {
                    tracing::warn!(
                        from = %old_path.display(),
                        to = %archived.display(),
                        "rotating log file failed: {err}"
                    );
                }
            }
        }

        let path = self.config.dir.join(self.current_name());
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        state.file = Some(file);
        state.current_stamp = new_stamp;
        Ok(())
    }

    fn sweep_expired(&self) {
        if self.config.expire_days <= 0 {
            return;
        }
        let cutoff = SystemTime::now()
            - Duration::from_secs(60 * 60 * 24 * self.config.expire_days as u64);
        let entries = match fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %self.config.dir.display(), "reading log dir failed: {err}");
                return;
            }
        };
        let prefix = format!("{}-", self.base);
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".log") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(file = %name, "deleted expired log file"),
                Err(err) => tracing::warn!(file = %name, "deleting expired log file failed: {err}"),
            }
        }
    }

    /// Files belonging to this sink (current plus rotated), mtime desc.
    pub fn list_files(&self) -> Result<Vec<LogFileInfo>, AccessLogError> {
        let current = self.current_name();
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.config.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&self.base) || !name.ends_with(".log") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            out.push(LogFileInfo {
                is_current: name == current,
                path: entry.path(),
                size: meta.len(),
                modified: OffsetDateTime::from(modified),
                name,
            });
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(out)
    }

    /// Read `limit` bytes (default 1 MiB) starting at `offset`. The name must
    /// be a bare file name inside the sink directory.
    pub fn read_slice(
        &self,
        filename: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<u8>, AccessLogError> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return Err(AccessLogError::UnknownFile(filename.to_string()));
        }
        let path = self.config.dir.join(filename);
        if !path.is_file() {
            return Err(AccessLogError::UnknownFile(filename.to_string()));
        }
        let mut file = File::open(path)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        let limit = if limit == 0 { DEFAULT_READ_LIMIT } else { limit };
        let mut buf = Vec::new();
        file.take(limit).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_stamps() {
        let at = time::macros::datetime!(2026-03-05 17:42:00 UTC);
        assert_eq!(RotatePeriod::Hour.stamp(at), "2026030517");
        assert_eq!(RotatePeriod::Day.stamp(at), "20260305");
    }

    #[tokio::test]
    async fn write_list_and_slice() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(FileSinkConfig {
            dir: dir.path().to_path_buf(),
            file: "access.log".to_string(),
            period: RotatePeriod::Day,
            expire_days: 3,
        })
        .unwrap();

        sink.write(b"first line\n").unwrap();
        sink.write(b"second line\n").unwrap();

        let files = sink.list_files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_current);
        assert_eq!(files[0].name, "access.log");
        assert_eq!(files[0].size, 23);

        let slice = sink.read_slice("access.log", 6, 4).unwrap();
        assert_eq!(slice, b"line");
        let rest = sink.read_slice("access.log", 11, 0).unwrap();
        assert_eq!(rest, b"second line\n");
    }

    #[tokio::test]
    async fn read_slice_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(FileSinkConfig {
            dir: dir.path().to_path_buf(),
            file: "access".to_string(),
            period: RotatePeriod::Day,
            expire_days: 0,
        })
        .unwrap();
        assert!(matches!(
            sink.read_slice("../etc/passwd", 0, 0).unwrap_err(),
            AccessLogError::UnknownFile(_)
        ));
    }

    #[tokio::test]
    async fn stale_stamp_archives_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(FileSinkConfig {
            dir: dir.path().to_path_buf(),
            file: "access".to_string(),
            period: RotatePeriod::Hour,
            expire_days: 0,
        })
        .unwrap();
        sink.write(b"old period\n").unwrap();

        // Simulate a period boundary by faking the recorded stamp.
        {
            let mut state = sink.lock_state();
            state.current_stamp = "2020010100".to_string();
        }
        sink.write(b"new period\n").unwrap();

        let names: Vec<String> = sink
            .list_files()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert!(names.contains(&"access.log".to_string()));
        assert!(names.contains(&"access-2020010100.log".to_string()));
    }

    #[tokio::test]
    async fn closed_sink_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(FileSinkConfig {
            dir: dir.path().to_path_buf(),
            file: "access".to_string(),
            period: RotatePeriod::Day,
            expire_days: 0,
        })
        .unwrap();
        sink.close();
        assert!(matches!(
            sink.write(b"x").unwrap_err(),
            AccessLogError::Closed
        ));
    }
}
