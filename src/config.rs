// ⚙️ Ingestion configuration
// Defaults + MMP_* environment overrides

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one ingestion service instance
#[derive(Debug, Clone, Serialize)]
pub struct IngestConfig {
    /// Entries per insert batch
    pub batch_size: usize,

    /// Largest accepted upload (bytes)
    pub max_file_bytes: usize,

    /// Upper bound for every network-bound step
    pub step_timeout: Duration,

    /// Without project/month, the same filename is rejected inside this window
    pub duplicate_window: Duration,

    /// Plans left `pending` longer than this are swept
    pub pending_ttl: Duration,

    /// Key prefix inside the object store
    pub storage_prefix: String,

    /// Activity type stamped on newly registered sites
    pub default_activity_type: String,

    pub database_path: PathBuf,
    pub storage_root: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_size: 50,
            max_file_bytes: 10 * 1024 * 1024,
            step_timeout: Duration::from_secs(30),
            duplicate_window: Duration::from_secs(10 * 60),
            pending_ttl: Duration::from_secs(30 * 60),
            storage_prefix: "mmp-files".to_string(),
            default_activity_type: "TPM".to_string(),
            database_path: PathBuf::from("./mmp.db"),
            storage_root: PathBuf::from("./storage"),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = IngestConfig::default();
        Self {
            batch_size: env_parse("MMP_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_size),
            max_file_bytes: env_parse("MMP_MAX_FILE_BYTES").unwrap_or(defaults.max_file_bytes),
            step_timeout: env_parse("MMP_STEP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_timeout),
            duplicate_window: env_parse("MMP_DUPLICATE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.duplicate_window),
            pending_ttl: env_parse("MMP_PENDING_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pending_ttl),
            storage_prefix: std::env::var("MMP_STORAGE_PREFIX")
                .unwrap_or(defaults.storage_prefix),
            default_activity_type: std::env::var("MMP_ACTIVITY_TYPE")
                .unwrap_or(defaults.default_activity_type),
            database_path: std::env::var("MMP_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            storage_root: std::env::var("MMP_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
        }
    }

    /// Builder pattern: override batch size (zero is clamped to one)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.storage_prefix, "mmp-files");
    }

    #[test]
    fn test_builder_clamps_batch_size() {
        let config = IngestConfig::default().with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }
}
