// =============================================================================
// Persistence — REST store client with a bounded retry queue
// =============================================================================
//
// Durable writes (sessions, trades, events) go to a hosted Postgres REST
// endpoint. Failures never block trading: the write is queued and retried
// by the orchestrator's 300 s drain loop. The queue is bounded; when it
// overflows, the oldest writes are dropped.
// =============================================================================

pub mod local;
pub mod session;
pub mod trade_log;

use std::collections::VecDeque;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use local::LocalStorage;

const RETRY_QUEUE_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Operation {
    Insert,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingWrite {
    table: String,
    data: serde_json::Value,
    operation: Operation,
    /// For updates: column name and value of the row filter.
    filter: Option<(String, String)>,
}

pub struct StoreClient {
    url: String,
    key: String,
    enabled: bool,
    http: reqwest::Client,
    retry_queue: Mutex<VecDeque<PendingWrite>>,
    storage: LocalStorage,
}

impl StoreClient {
    pub fn new(
        url: impl Into<String>,
        key: impl Into<String>,
        enabled: bool,
        base_dir: impl AsRef<Path>,
    ) -> Self {
        let url = url.into();
        let key = key.into();
        let enabled = enabled && !url.is_empty() && !key.is_empty();
        let storage = LocalStorage::new(base_dir);

        if enabled {
            info!(url = %url, "persistence store enabled");
        } else {
            info!("persistence store disabled");
        }

        // Writes queued by a previous run survive in pending_uploads.json.
        let mut retry_queue = VecDeque::new();
        if enabled {
            for item in storage.load_pending() {
                if let Ok(write) = serde_json::from_value::<PendingWrite>(item) {
                    retry_queue.push_back(write);
                }
            }
            if !retry_queue.is_empty() {
                info!(count = retry_queue.len(), "recovered pending uploads");
            }
        }

        Self {
            url,
            key,
            enabled,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build http client"),
            retry_queue: Mutex::new(retry_queue),
            storage,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pending_count(&self) -> usize {
        self.retry_queue.lock().len()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert a row. Failures are queued for retry and reported as `false`.
    pub async fn insert(&self, table: &str, data: serde_json::Value) -> bool {
        if !self.enabled {
            return false;
        }
        let write = PendingWrite {
            table: table.to_string(),
            data,
            operation: Operation::Insert,
            filter: None,
        };
        match self.execute(&write).await {
            Ok(()) => true,
            Err(e) => {
                warn!(table, error = %e, "insert failed — queued for retry");
                self.enqueue(write);
                false
            }
        }
    }

    /// Update rows matching `filter_key = filter_val`.
    pub async fn update(
        &self,
        table: &str,
        data: serde_json::Value,
        filter_key: &str,
        filter_val: &str,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let write = PendingWrite {
            table: table.to_string(),
            data,
            operation: Operation::Update,
            filter: Some((filter_key.to_string(), filter_val.to_string())),
        };
        match self.execute(&write).await {
            Ok(()) => true,
            Err(e) => {
                warn!(table, error = %e, "update failed — queued for retry");
                self.enqueue(write);
                false
            }
        }
    }

    /// Insert an event row with standard shape.
    pub async fn log_event(&self, event_type: &str, data: serde_json::Value, session_id: &str) {
        self.insert(
            "events",
            serde_json::json!({
                "session_id": session_id,
                "timestamp": Utc::now().to_rfc3339(),
                "event_type": event_type,
                "data": data.to_string(),
            }),
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Retry
    // -------------------------------------------------------------------------

    /// Drain the retry queue. Writes that fail again go back to the queue.
    /// Returns the number of successful retries.
    pub async fn retry_pending(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        let drained: Vec<PendingWrite> = {
            let mut queue = self.retry_queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }

        let mut succeeded = 0;
        let mut failed = Vec::new();
        for write in drained {
            match self.execute(&write).await {
                Ok(()) => succeeded += 1,
                Err(_) => failed.push(write),
            }
        }

        let remaining = failed.len();
        {
            let mut queue = self.retry_queue.lock();
            for write in failed {
                queue.push_back(write);
            }
        }
        self.snapshot_pending();

        if succeeded > 0 {
            info!(succeeded, remaining, "persistence retries flushed");
        }
        succeeded
    }

    fn enqueue(&self, write: PendingWrite) {
        {
            let mut queue = self.retry_queue.lock();
            if queue.len() >= RETRY_QUEUE_CAP {
                queue.pop_front();
            }
            queue.push_back(write);
        }
        self.snapshot_pending();
    }

    /// Mirror the in-memory queue to pending_uploads.json so queued writes
    /// survive a crash.
    fn snapshot_pending(&self) {
        let items: Vec<serde_json::Value> = self
            .retry_queue
            .lock()
            .iter()
            .filter_map(|w| serde_json::to_value(w).ok())
            .collect();
        self.storage.save_pending(&items);
    }

    async fn execute(&self, write: &PendingWrite) -> anyhow::Result<()> {
        let url = format!("{}/rest/v1/{}", self.url.trim_end_matches('/'), write.table);

        let request = match write.operation {
            Operation::Insert => self.http.post(&url).json(&write.data),
            Operation::Update => {
                let (key, val) = write
                    .filter
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("update without filter"))?;
                self.http
                    .patch(format!("{url}?{key}=eq.{val}"))
                    .json(&write.data)
            }
        };

        let response = request
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Prefer", "return=minimal")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("store returned {status}");
        }
        Ok(())
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("pending", &self.pending_count())
            .finish()
    }
}
