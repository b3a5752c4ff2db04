use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;

/// Matches key names that should have their values redacted before being
/// written to the audit log, regardless of which backend or tool produced
/// them.
fn redaction_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(api[_-]?key|token|password|passwd|secret|credential|auth|bearer)").unwrap()
    })
}

const REDACTED: &str = "***REDACTED***";

/// Recursively redact any object key matching the secret-like pattern,
/// leaving the JSON shape intact (arrays/objects keep their length/keys, only
/// values behind sensitive keys are blanked).
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if redaction_pattern().is_match(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// A single audit record. Serialized as one JSON object per line (JSONL).
#[derive(serde::Serialize)]
pub struct AuditRecord<'a> {
    pub timestamp: String,
    pub event: &'a str,
    pub backend: Option<&'a str>,
    pub capability: Option<&'a str>,
    pub outcome: &'a str,
    pub detail: Value,
}

/// Rotate once the active file reaches this size.
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Delete rotated (and gzipped) siblings older than this.
const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A `Write` implementor that rotates the active audit file once it crosses
/// `max_bytes`, gzip-compresses the rolled-over file, and sweeps siblings
/// past `retention` on every rotation. Runs on `tracing-appender`'s
/// background writer thread, so the blocking rename/compress/sweep never
/// touches the async request path.
struct RotatingWriter {
    dir: PathBuf,
    base_name: String,
    max_bytes: u64,
    retention: Duration,
    file: std::fs::File,
    size: u64,
}

impl RotatingWriter {
    fn open(dir: PathBuf, base_name: String, max_bytes: u64, retention: Duration) -> io::Result<Self> {
        let path = dir.join(&base_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            dir,
            base_name,
            max_bytes,
            retention,
            file,
            size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        let path = self.dir.join(&self.base_name);
        let timestamp = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let rotated_path = self.dir.join(format!("{}.{timestamp}", self.base_name));

        std::fs::rename(&path, &rotated_path)?;
        if let Err(e) = compress_and_remove(&rotated_path) {
            warn!(path = %rotated_path.display(), error = %e, "failed to gzip rotated audit log");
        }

        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.size = 0;
        sweep_expired(&self.dir, &self.base_name, self.retention);
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn compress_and_remove(rotated_path: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(std::fs::File::open(rotated_path)?);
    let gz_path = PathBuf::from(format!("{}.gz", rotated_path.display()));
    let mut encoder = GzEncoder::new(std::fs::File::create(&gz_path)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    std::fs::remove_file(rotated_path)?;
    Ok(())
}

/// Delete rotated siblings of `base_name` (`<base_name>.<ts>` or
/// `<base_name>.<ts>.gz`) last modified before `retention` ago. The active
/// file itself is never touched.
fn sweep_expired(dir: &Path, base_name: &str, retention: Duration) {
    let cutoff = match SystemTime::now().checked_sub(retention) {
        Some(c) => c,
        None => return,
    };

    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if file_name == base_name || !file_name.starts_with(base_name) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove expired audit log");
            }
        }
    }
}

/// Append-only JSONL audit sink with size-triggered rotation (default
/// 10 MB), retention sweep (default 30 days), and gzip compression of
/// rotated files, plus built-in secret redaction on every record before it
/// touches disk.
pub struct AuditLog {
    writer: tracing_appender::non_blocking::NonBlocking,
    _guard: WorkerGuard,
}

impl AuditLog {
    pub fn new(path: &std::path::Path) -> anyhow::Result<Self> {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("audit.jsonl")
            .to_string();

        let appender = RotatingWriter::open(dir.to_path_buf(), file_name, DEFAULT_MAX_BYTES, DEFAULT_RETENTION)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        Ok(Self {
            writer,
            _guard: guard,
        })
    }

    /// Write one redacted record as a JSON line.
    pub fn record(
        &self,
        event: &str,
        backend: Option<&str>,
        capability: Option<&str>,
        outcome: &str,
        detail: Value,
    ) {
        let record = AuditRecord {
            timestamp: now_rfc3339(),
            event,
            backend,
            capability,
            outcome,
            detail: redact(&detail),
        };

        match serde_json::to_string(&record) {
            Ok(mut line) => {
                line.push('\n');
                use std::io::Write;
                let mut writer = &self.writer;
                if let Err(e) = writer.write_all(line.as_bytes()) {
                    warn!(error = %e, "failed to write audit record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize audit record"),
        }
    }
}

fn now_rfc3339() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:09}Z", now.as_secs(), now.subsec_nanos())
}

pub fn default_audit_log_path() -> PathBuf {
    crate::cli::config_home().join("audit.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_top_level_key() {
        let input = json!({"api_key": "sk-12345", "query": "weather"});
        let output = redact(&input);
        assert_eq!(output["api_key"], json!("***REDACTED***"));
        assert_eq!(output["query"], json!("weather"));
    }

    #[test]
    fn test_redact_nested() {
        let input = json!({"headers": {"Authorization": "Bearer xyz"}, "body": {"token": "t1"}});
        let output = redact(&input);
        assert_eq!(output["headers"]["Authorization"], json!("***REDACTED***"));
        assert_eq!(output["body"]["token"], json!("***REDACTED***"));
    }

    #[test]
    fn test_redact_array_of_objects() {
        let input = json!([{"password": "p1"}, {"name": "ok"}]);
        let output = redact(&input);
        assert_eq!(output[0]["password"], json!("***REDACTED***"));
        assert_eq!(output[1]["name"], json!("ok"));
    }

    #[test]
    fn test_redact_case_insensitive() {
        let input = json!({"API_KEY": "x", "Secret": "y", "PASSWORD": "z"});
        let output = redact(&input);
        assert_eq!(output["API_KEY"], json!("***REDACTED***"));
        assert_eq!(output["Secret"], json!("***REDACTED***"));
        assert_eq!(output["PASSWORD"], json!("***REDACTED***"));
    }

    #[test]
    fn test_rotating_writer_rotates_and_compresses_past_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RotatingWriter::open(dir.path().to_path_buf(), "audit.jsonl".to_string(), 16, DEFAULT_RETENTION)
                .unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();

        let mut rotated_gz = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
            let name = entry.file_name().into_string().unwrap();
            if name.starts_with("audit.jsonl.") && name.ends_with(".gz") {
                rotated_gz += 1;
            }
        }
        assert_eq!(rotated_gz, 1);
        assert_eq!(std::fs::read(dir.path().join("audit.jsonl")).unwrap(), b"0123456789");
    }

    #[test]
    fn test_sweep_expired_removes_old_siblings_not_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("audit.jsonl");
        let old_rotated = dir.path().join("audit.jsonl.111.gz");
        std::fs::write(&active, b"current").unwrap();
        std::fs::write(&old_rotated, b"stale").unwrap();

        let ancient = std::time::SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::open(&old_rotated).unwrap();
        file.set_modified(ancient).unwrap();

        sweep_expired(dir.path(), "audit.jsonl", Duration::from_secs(1));

        assert!(active.exists());
        assert!(!old_rotated.exists());
    }
}
