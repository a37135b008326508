//! Retention sweeper for dialog logs and the cost store.
//!
//! Runs at startup and on demand via the ops surface. The log phase
//! compresses (or deletes) JSONL files older than the age policy, then
//! trims total size oldest-first. The DB phase drops cost rows older
//! than the metrics age policy. Files and rows are only ever removed
//! whole — nothing is mutated in place.

use std::fs::File;
use std::io::{copy, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use super::costs::CostStore;
use crate::config::RetentionPolicy;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LogSweepStats {
    pub compressed: u64,
    pub deleted: u64,
    pub freed_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DbSweepStats {
    pub deleted: u64,
}

/// Sweep JSONL files in `log_dir` per the policy. Returns what was
/// compressed, deleted, and how many MiB were freed.
pub fn cleanup_logs(log_dir: &Path, policy: &RetentionPolicy) -> LogSweepStats {
    let mut stats = LogSweepStats::default();
    let cutoff = SystemTime::now()
        - std::time::Duration::from_secs(policy.log_max_age_days * 24 * 60 * 60);

    // Age phase: gzip or drop everything older than the cutoff
    for path in jsonl_files(log_dir, false) {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let Ok(mtime) = meta.modified() else {
            continue;
        };
        if mtime >= cutoff {
            continue;
        }
        let size = meta.len();
        if policy.log_compress {
            match compress_file(&path) {
                Ok(gz_size) => {
                    stats.compressed += 1;
                    stats.freed_mb += mb(size.saturating_sub(gz_size));
                    tracing::info!(file = %path.display(), "retention: compressed");
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "retention: compression failed");
                }
            }
        } else {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    stats.deleted += 1;
                    stats.freed_mb += mb(size);
                    tracing::info!(file = %path.display(), "retention: deleted");
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "retention: delete failed");
                }
            }
        }
    }

    // Size phase: drop oldest active files until under the byte budget
    if policy.log_max_size_mb > 0 {
        let limit = policy.log_max_size_mb * 1024 * 1024;
        let active = jsonl_files(log_dir, false);
        let mut total: u64 = active
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        for path in active {
            if total <= limit {
                break;
            }
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    total = total.saturating_sub(size);
                    stats.deleted += 1;
                    stats.freed_mb += mb(size);
                    tracing::info!(file = %path.display(), "retention (size): deleted");
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "retention (size): delete failed");
                }
            }
        }
    }

    stats.freed_mb = (stats.freed_mb * 100.0).round() / 100.0;
    stats
}

/// Drop cost rows older than the metrics age policy.
pub async fn cleanup_metrics(store: &CostStore, policy: &RetentionPolicy) -> DbSweepStats {
    let cutoff = Utc::now() - Duration::days(policy.metrics_max_age_days as i64);
    let deleted = store.delete_older_than(cutoff).await;
    if deleted > 0 {
        tracing::info!(deleted, max_age_days = policy.metrics_max_age_days, "retention: cost rows removed");
    }
    DbSweepStats { deleted }
}

/// JSONL files in `dir` (rotations included), oldest mtime first.
/// `with_gz` controls whether already-compressed files are listed.
fn jsonl_files(dir: &Path, with_gz: bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.contains(".jsonl") && (with_gz || !name.ends_with(".gz"))
        })
        .collect();
    files.sort_by_key(|p| {
        std::fs::metadata(p)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    });
    files
}

/// Gzip `path` to `path.gz` and remove the original. Returns the
/// compressed size.
fn compress_file(path: &Path) -> std::io::Result<u64> {
    let gz_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    let mut reader = BufReader::new(File::open(path)?);
    let writer = BufWriter::new(File::create(&gz_path)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(std::fs::metadata(&gz_path)?.len())
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn policy(age_days: u64, size_mb: u64, compress: bool) -> RetentionPolicy {
        RetentionPolicy {
            log_max_age_days: age_days,
            log_max_size_mb: size_mb,
            log_compress: compress,
            metrics_max_age_days: 90,
        }
    }

    #[test]
    fn old_file_is_compressed_and_original_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anthropic.jsonl");
        std::fs::write(&path, "line one\nline two\n".repeat(100)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        // age zero: everything written before this call is past the cutoff
        let stats = cleanup_logs(dir.path(), &policy(0, 0, true));
        assert_eq!(stats.compressed, 1);
        assert_eq!(stats.deleted, 0);
        assert!(!path.exists());

        let gz_path = dir.path().join("anthropic.jsonl.gz");
        assert!(gz_path.exists());
        let mut decoder = GzDecoder::new(File::open(&gz_path).unwrap());
        let mut content = String::new();
        decoder.read_to_string(&mut content).unwrap();
        assert!(content.starts_with("line one"));
    }

    #[test]
    fn old_file_is_deleted_when_compression_is_off() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("openai.jsonl");
        std::fs::write(&path, "x".repeat(2048)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let stats = cleanup_logs(dir.path(), &policy(0, 0, false));
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.compressed, 0);
        assert!(!path.exists());
        assert!(stats.freed_mb >= 0.0);
    }

    #[test]
    fn recent_file_is_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("google.jsonl");
        std::fs::write(&path, "fresh\n").unwrap();

        let stats = cleanup_logs(dir.path(), &policy(30, 0, true));
        assert_eq!(stats, LogSweepStats::default());
        assert!(path.exists());
    }

    #[test]
    fn size_sweep_removes_oldest_until_under_budget() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("openai.jsonl.2");
        let newer = dir.path().join("openai.jsonl.1");
        std::fs::write(&old, "a".repeat(1024 * 1024)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&newer, "b".repeat(512)).unwrap();

        // generous age policy so only the size phase acts
        let stats = cleanup_logs(dir.path(), &policy(365, 1, true));
        assert_eq!(stats.deleted, 1);
        assert!(!old.exists());
        assert!(newer.exists());
    }

    #[test]
    fn gz_files_are_never_reprocessed() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("openai.jsonl.gz");
        std::fs::write(&gz, "already compressed").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let stats = cleanup_logs(dir.path(), &policy(0, 0, true));
        assert_eq!(stats, LogSweepStats::default());
        assert!(gz.exists());
    }

    #[test]
    fn non_jsonl_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let other = dir.path().join("costs.db");
        std::fs::write(&other, "sqlite data").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        cleanup_logs(dir.path(), &policy(0, 0, false));
        assert!(other.exists());
    }
}
