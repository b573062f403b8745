// =============================================================================
// Local storage — offline backup for pending uploads and bar cache
// =============================================================================
//
// Two concerns share this module: the durable copy of the persistence
// retry queue (`pending_uploads.json`, reloaded on startup so a crash does
// not lose queued writes) and an optional per-symbol bar cache under
// `cache/`, used as a warmup fallback when the history fetch fails.
// =============================================================================

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::Bar;

pub const PENDING_FILE: &str = "pending_uploads.json";

pub struct LocalStorage {
    pending_file: PathBuf,
    cache_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        let cache_dir = base_dir.join("cache");
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!(error = %e, "failed to create cache directory");
        }
        Self {
            pending_file: base_dir.join(PENDING_FILE),
            cache_dir,
        }
    }

    // -------------------------------------------------------------------------
    // Pending uploads
    // -------------------------------------------------------------------------

    /// Overwrite the pending-uploads file with the current queue snapshot.
    pub fn save_pending(&self, items: &[serde_json::Value]) {
        if items.is_empty() {
            self.clear_pending();
            return;
        }
        match serde_json::to_string_pretty(items) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.pending_file, json) {
                    warn!(error = %e, "failed to save pending uploads");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise pending uploads"),
        }
    }

    pub fn load_pending(&self) -> Vec<serde_json::Value> {
        let Ok(raw) = std::fs::read_to_string(&self.pending_file) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn clear_pending(&self) {
        let _ = std::fs::remove_file(&self.pending_file);
    }

    // -------------------------------------------------------------------------
    // Bar cache
    // -------------------------------------------------------------------------

    pub fn cache_bars(&self, symbol: &str, bars: &[Bar]) {
        let path = self.cache_dir.join(format!("{symbol}_bars.json"));
        match serde_json::to_string(bars) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(%symbol, error = %e, "failed to cache bars");
                }
            }
            Err(e) => warn!(%symbol, error = %e, "failed to serialise bar cache"),
        }
    }

    pub fn load_cached_bars(&self, symbol: &str) -> Vec<Bar> {
        let path = self.cache_dir.join(format!("{symbol}_bars.json"));
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(storage.load_pending().is_empty());

        storage.save_pending(&[serde_json::json!({"a": 1}), serde_json::json!({"b": 2})]);
        let loaded = storage.load_pending();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["a"], 1);

        storage.clear_pending();
        assert!(storage.load_pending().is_empty());
    }

    #[test]
    fn saving_empty_queue_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.save_pending(&[serde_json::json!({"a": 1})]);
        storage.save_pending(&[]);
        assert!(!dir.path().join(PENDING_FILE).exists());
    }

    #[test]
    fn bar_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let bars = vec![Bar {
            symbol: "EURUSD".into(),
            time: 900,
            open: 1.1,
            high: 1.2,
            low: 1.0,
            close: 1.15,
            volume: 3.0,
        }];
        storage.cache_bars("EURUSD", &bars);

        let loaded = storage.load_cached_bars("EURUSD");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].time, 900);
        assert!((loaded[0].close - 1.15).abs() < 1e-12);

        assert!(storage.load_cached_bars("GBPUSD").is_empty());
    }
}
