//! Per-turn dialog log: one append-only JSONL file per provider.
//!
//! Entries carry the request/response/error payload plus the correlation
//! ids from the request context. The file rotates at 10 MiB with up to
//! five numbered backups; the enabled flag is toggled at runtime via the
//! ops surface and the `!dlglog` command. All write failures are logged
//! and swallowed — dialog logging never affects the caller.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::types::RequestContext;

const MAX_BYTES: u64 = 10 * 1024 * 1024;
const BACKUP_COUNT: u32 = 5;

/// One dialog log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogEntry {
    pub timestamp: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub session_id: Option<String>,
    pub heinzel_id: Option<String>,
    pub task_id: Option<String>,
    pub data: Value,
}

pub struct DialogLogger {
    provider: String,
    log_dir: PathBuf,
    enabled: AtomicBool,
    // serializes append + rotation so concurrent turns never interleave a line
    write_lock: Mutex<()>,
}

impl DialogLogger {
    pub fn new(provider: impl Into<String>, log_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            provider: provider.into(),
            log_dir: log_dir.into(),
            enabled: AtomicBool::new(enabled),
            write_lock: Mutex::new(()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn log_request(&self, endpoint: &str, payload: &Value, ctx: &RequestContext) {
        self.append("request", json!({ "endpoint": endpoint, "payload": payload }), ctx);
    }

    pub fn log_response(&self, endpoint: &str, status: u16, content: &Value, ctx: &RequestContext) {
        self.append(
            "response",
            json!({ "endpoint": endpoint, "status": status, "content": content }),
            ctx,
        );
    }

    pub fn log_error(&self, endpoint: &str, error: &str, ctx: &RequestContext) {
        self.append("error", json!({ "endpoint": endpoint, "error": error }), ctx);
    }

    fn append(&self, entry_type: &str, data: Value, ctx: &RequestContext) {
        if !self.enabled() {
            return;
        }
        let entry = DialogEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            provider: self.provider.clone(),
            entry_type: entry_type.to_string(),
            session_id: ctx.session_id.clone(),
            heinzel_id: ctx.heinzel_id.clone(),
            task_id: ctx.task_id.clone(),
            data,
        };
        // serde_json keeps non-ASCII characters unescaped
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "dialog entry serialization failed");
                return;
            }
        };
        if let Err(e) = self.write_line(&line) {
            tracing::warn!(error = %e, provider = %self.provider, "dialog log write failed");
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().expect("dialog log lock poisoned");
        std::fs::create_dir_all(&self.log_dir)?;
        let path = self.log_path();
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() + line.len() as u64 + 1 > MAX_BYTES {
                self.rotate(&path)?;
            }
        }
        let mut file: File = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    /// Shift `.jsonl.N` to `.jsonl.N+1` (dropping `.jsonl.5`) and move the
    /// current file to `.jsonl.1`.
    fn rotate(&self, path: &Path) -> std::io::Result<()> {
        for n in (1..BACKUP_COUNT).rev() {
            let from = backup_path(path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(path, n + 1))?;
            }
        }
        std::fs::rename(path, backup_path(path, 1))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", self.provider))
    }
}

fn backup_path(base: &Path, n: u32) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Filters for [`read_logs`]. Equality filters apply when set; `since` /
/// `until` are RFC 3339 timestamps.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub session_id: Option<String>,
    pub heinzel_id: Option<String>,
    pub task_id: Option<String>,
    pub entry_type: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: usize,
}

/// Read dialog entries, newest first: current file first, then the
/// numbered rotations, each scanned bottom-up. Malformed lines are
/// skipped silently. At most `limit` entries (capped at 1000).
pub fn read_logs(log_dir: &Path, provider: &str, filter: &LogFilter) -> Vec<DialogEntry> {
    let limit = if filter.limit == 0 {
        100
    } else {
        filter.limit.min(1000)
    };
    let since = filter.since.as_deref().and_then(parse_ts);
    let until = filter.until.as_deref().and_then(parse_ts);

    let base = log_dir.join(format!("{provider}.jsonl"));
    let mut files = vec![base.clone()];
    for n in 1..=BACKUP_COUNT {
        files.push(backup_path(&base, n));
    }

    let mut results = Vec::new();
    for path in files {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<DialogEntry>(line) else {
                continue;
            };
            if !matches_filter(&entry, filter, since, until) {
                continue;
            }
            results.push(entry);
            if results.len() >= limit {
                return results;
            }
        }
    }
    results
}

fn matches_filter(
    entry: &DialogEntry,
    filter: &LogFilter,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> bool {
    if let Some(want) = &filter.session_id {
        if entry.session_id.as_deref() != Some(want) {
            return false;
        }
    }
    if let Some(want) = &filter.heinzel_id {
        if entry.heinzel_id.as_deref() != Some(want) {
            return false;
        }
    }
    if let Some(want) = &filter.task_id {
        if entry.task_id.as_deref() != Some(want) {
            return false;
        }
    }
    if let Some(want) = &filter.entry_type {
        if &entry.entry_type != want {
            return false;
        }
    }
    if since.is_some() || until.is_some() {
        // entries with unparseable timestamps pass the time filters
        if let Some(ts) = parse_ts(&entry.timestamp) {
            if since.is_some_and(|s| ts < s) {
                return false;
            }
            if until.is_some_and(|u| ts > u) {
                return false;
            }
        }
    }
    true
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn ctx(session: &str) -> RequestContext {
        RequestContext {
            session_id: Some(session.to_string()),
            heinzel_id: Some("h1".to_string()),
            task_id: None,
        }
    }

    #[test]
    fn round_trip_with_filters() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("anthropic", dir.path(), true);

        logger.log_request("/chat", &json!({"model": "claude"}), &ctx("s1"));
        logger.log_response("/chat", 200, &json!({"content": "hällo wörld"}), &ctx("s1"));
        logger.log_error("/chat", "boom", &ctx("s2"));

        let all = read_logs(dir.path(), "anthropic", &LogFilter::default());
        assert_eq!(all.len(), 3);
        // newest first
        assert_eq!(all[0].entry_type, "error");
        assert_eq!(all[2].entry_type, "request");

        let s1 = read_logs(
            dir.path(),
            "anthropic",
            &LogFilter {
                session_id: Some("s1".into()),
                ..Default::default()
            },
        );
        assert_eq!(s1.len(), 2);

        let responses = read_logs(
            dir.path(),
            "anthropic",
            &LogFilter {
                entry_type: Some("response".into()),
                ..Default::default()
            },
        );
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].data["content"], "hällo wörld");

        let limited = read_logs(
            dir.path(),
            "anthropic",
            &LogFilter {
                limit: 1,
                ..Default::default()
            },
        );
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn since_filter_excludes_older_entries() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("openai", dir.path(), true);
        logger.log_request("/chat", &json!({}), &ctx("s1"));

        let future = read_logs(
            dir.path(),
            "openai",
            &LogFilter {
                since: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            },
        );
        assert!(future.is_empty());

        let past = read_logs(
            dir.path(),
            "openai",
            &LogFilter {
                since: Some("2000-01-01T00:00:00Z".into()),
                ..Default::default()
            },
        );
        assert_eq!(past.len(), 1);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("google", dir.path(), false);
        logger.log_request("/chat", &json!({}), &RequestContext::default());
        assert!(!logger.log_path().exists());

        logger.set_enabled(true);
        logger.log_request("/chat", &json!({}), &RequestContext::default());
        assert!(logger.log_path().exists());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("openai", dir.path(), true);
        logger.log_request("/chat", &json!({}), &ctx("s1"));

        let path = logger.log_path();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("this is not json\n");
        std::fs::write(&path, content).unwrap();

        let entries = read_logs(dir.path(), "openai", &LogFilter::default());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn reader_includes_rotated_files() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("openai", dir.path(), true);
        logger.log_request("/chat", &json!({"turn": 1}), &ctx("s1"));

        // simulate a rotation
        std::fs::rename(logger.log_path(), backup_path(&logger.log_path(), 1)).unwrap();
        logger.log_request("/chat", &json!({"turn": 2}), &ctx("s1"));

        let entries = read_logs(dir.path(), "openai", &LogFilter::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data["payload"]["turn"], 2);
        assert_eq!(entries[1].data["payload"]["turn"], 1);
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let dir = TempDir::new().unwrap();
        let logger = DialogLogger::new("openai", dir.path(), true);
        logger.log_request("/chat", &json!({}), &RequestContext::default());

        let entries = read_logs(dir.path(), "openai", &LogFilter::default());
        assert!(entries[0].timestamp.ends_with('Z'));
        assert!(parse_ts(&entries[0].timestamp).is_some());
    }
}
