pub mod agent_core;
pub mod commands;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Async mutex for state that is held across `.await`.
pub type TokioMutex<T> = tokio::sync::Mutex<T>;

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "relay.log";

/// Return the platform-standard data directory for the relay.
///
/// - macOS: `~/Library/Application Support/mcp-relay/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-relay\`
/// - Linux: `$XDG_DATA_HOME/mcp-relay/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-relay/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-relay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-relay")
}

/// Truncate a string to at most `max_bytes` without splitting a character.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backward to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// On each startup:
/// 1. Rotates existing logs (relay.log → relay.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh relay.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// Returns the log file path.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_relay=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-relay starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `relay.log` → `relay.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// if the relay is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // "é" is two bytes; cutting at 1 must not split it.
        assert_eq!(truncate_utf8("é", 1), "");
        assert_eq!(truncate_utf8("aé", 2), "a");
    }

    #[test]
    fn test_rotate_log_file_keeps_last_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);

        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let read = |suffix: u32| {
            std::fs::read_to_string(format!("{}.{suffix}", base.display())).unwrap()
        };
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!Path::new(&format!("{}.4", base.display())).exists());
    }

    #[test]
    fn test_data_dir_is_named_for_relay() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy();
        assert!(name.contains("mcp-relay"));
    }
}
