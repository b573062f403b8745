// =============================================================================
// Session manager — lifecycle, crash recovery and day-boundary detection
// =============================================================================
//
// A running session keeps a local `.session_state.json` snapshot. On
// startup, a snapshot still marked RUNNING means the previous process
// crashed: the session is resumed under the same id instead of opening a
// new one. The snapshot is removed on clean shutdown.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::StoreClient;

pub const STATE_FILE: &str = ".session_state.json";

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEndReason {
    Normal,
    Emergency,
    DayChange,
    Recovered,
    Manual,
    Unknown,
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Emergency => "EMERGENCY",
            Self::DayChange => "DAY_CHANGE",
            Self::Recovered => "RECOVERED",
            Self::Manual => "MANUAL",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionState {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    start_time: String,
    #[serde(default)]
    initial_balance: f64,
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    last_heartbeat: String,
    #[serde(default)]
    current_balance: f64,
}

/// Session end statistics.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub balance: f64,
    pub total_trades: usize,
    pub total_pnl: f64,
}

struct Inner {
    session_id: String,
    start_time: Option<DateTime<Utc>>,
    is_recovered: bool,
    day_start: Option<DateTime<Utc>>,
    running: bool,
}

pub struct SessionManager {
    store: Arc<StoreClient>,
    state_file: PathBuf,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(store: Arc<StoreClient>, base_dir: impl AsRef<Path>) -> Self {
        Self {
            store,
            state_file: base_dir.as_ref().join(STATE_FILE),
            inner: Mutex::new(Inner {
                session_id: String::new(),
                start_time: None,
                is_recovered: false,
                day_start: None,
                running: false,
            }),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.lock().session_id.clone()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().start_time
    }

    pub fn is_recovered(&self) -> bool {
        self.inner.lock().is_recovered
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a new session, or resume the previous one when its snapshot
    /// still says RUNNING. Returns the session id.
    pub async fn start_session(&self, initial_balance: f64, symbols: &[String]) -> String {
        if let Some(recovered) = self.load_state() {
            if recovered.status == "RUNNING" && !recovered.session_id.is_empty() {
                let session_id = recovered.session_id.clone();
                {
                    let mut inner = self.inner.lock();
                    inner.session_id = session_id.clone();
                    inner.is_recovered = true;
                    inner.start_time = Some(Utc::now());
                    inner.day_start = Some(day_start_utc(Utc::now()));
                    inner.running = true;
                }
                self.store
                    .log_event(
                        "SESSION_RECOVERED",
                        serde_json::json!({ "old_session_id": session_id }),
                        &session_id,
                    )
                    .await;
                info!(%session_id, "session recovered from crash snapshot");
                return session_id;
            }
        }

        let session_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let now = Utc::now();

        {
            let mut inner = self.inner.lock();
            inner.session_id = session_id.clone();
            inner.start_time = Some(now);
            inner.day_start = Some(day_start_utc(now));
            inner.is_recovered = false;
            inner.running = true;
        }

        self.save_state(&SessionState {
            session_id: session_id.clone(),
            start_time: now.to_rfc3339(),
            initial_balance,
            symbols: symbols.to_vec(),
            status: "RUNNING".to_string(),
            ..Default::default()
        });

        self.store
            .insert(
                "sessions",
                serde_json::json!({
                    "session_id": session_id,
                    "start_time": now.to_rfc3339(),
                    "initial_balance": initial_balance,
                    "symbols": symbols,
                    "status": "RUNNING",
                }),
            )
            .await;

        info!(%session_id, "new session started");
        session_id
    }

    /// End the session, push final stats and drop the crash snapshot.
    pub async fn end_session(&self, stats: &SessionStats, reason: SessionEndReason) {
        let session_id = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.session_id.clone()
        };

        self.store
            .update(
                "sessions",
                serde_json::json!({
                    "end_time": Utc::now().to_rfc3339(),
                    "final_balance": stats.balance,
                    "total_trades": stats.total_trades,
                    "total_pnl": stats.total_pnl,
                    "end_reason": reason.to_string(),
                    "status": "STOPPED",
                }),
                "session_id",
                &session_id,
            )
            .await;

        self.clear_state();
        info!(%session_id, reason = %reason, "session ended");
    }

    /// Refresh the crash snapshot with the current balance.
    pub fn update_heartbeat(&self, balance: f64) {
        if !self.inner.lock().running {
            return;
        }

        let mut state = self.load_state().unwrap_or_default();
        state.last_heartbeat = Utc::now().to_rfc3339();
        state.current_balance = balance;
        state.status = "RUNNING".to_string();
        if state.session_id.is_empty() {
            state.session_id = self.session_id();
        }
        self.save_state(&state);
    }

    /// True exactly once per UTC day rollover.
    pub fn check_day_boundary(&self) -> bool {
        let mut inner = self.inner.lock();
        let current_day = day_start_utc(Utc::now());

        match inner.day_start {
            None => {
                inner.day_start = Some(current_day);
                false
            }
            Some(day_start) if current_day > day_start => {
                inner.day_start = Some(current_day);
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot file
    // -------------------------------------------------------------------------

    fn save_state(&self, state: &SessionState) {
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_file, json) {
                    error!(error = %e, "failed to write session snapshot");
                }
            }
            Err(e) => error!(error = %e, "failed to serialise session snapshot"),
        }
    }

    fn load_state(&self) -> Option<SessionState> {
        let raw = std::fs::read_to_string(&self.state_file).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn clear_state(&self) {
        let _ = std::fs::remove_file(&self.state_file);
    }
}

fn day_start_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> SessionManager {
        let store = Arc::new(StoreClient::new("", "", false, dir));
        SessionManager::new(store, dir)
    }

    #[tokio::test]
    async fn new_session_gets_fresh_id_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let id = mgr.start_session(10_000.0, &["EURUSD".to_string()]).await;
        assert_eq!(id.len(), 8);
        assert!(!mgr.is_recovered());
        assert!(dir.path().join(STATE_FILE).exists());
    }

    #[tokio::test]
    async fn running_snapshot_recovers_same_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STATE_FILE),
            r#"{ "session_id": "abc12345", "status": "RUNNING" }"#,
        )
        .unwrap();

        let mgr = manager(dir.path());
        let id = mgr.start_session(10_000.0, &[]).await;
        assert_eq!(id, "abc12345");
        assert!(mgr.is_recovered());
    }

    #[tokio::test]
    async fn stopped_snapshot_gets_new_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STATE_FILE),
            r#"{ "session_id": "abc12345", "status": "STOPPED" }"#,
        )
        .unwrap();

        let mgr = manager(dir.path());
        let id = mgr.start_session(10_000.0, &[]).await;
        assert_ne!(id, "abc12345");
        assert!(!mgr.is_recovered());
    }

    #[tokio::test]
    async fn end_session_clears_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.start_session(10_000.0, &[]).await;

        mgr.end_session(&SessionStats::default(), SessionEndReason::Normal)
            .await;
        assert!(!dir.path().join(STATE_FILE).exists());

        // Idempotent.
        mgr.end_session(&SessionStats::default(), SessionEndReason::Normal)
            .await;
    }

    #[tokio::test]
    async fn heartbeat_updates_snapshot_balance() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.start_session(10_000.0, &[]).await;

        mgr.update_heartbeat(10_250.5);
        let raw = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(state["current_balance"], 10_250.5);
        assert_eq!(state["status"], "RUNNING");
    }

    #[tokio::test]
    async fn day_boundary_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.start_session(10_000.0, &[]).await;

        // Same day: no boundary.
        assert!(!mgr.check_day_boundary());

        // Force yesterday.
        mgr.inner.lock().day_start =
            Some(day_start_utc(Utc::now()) - chrono::Duration::days(1));
        assert!(mgr.check_day_boundary());
        assert!(!mgr.check_day_boundary());
    }
}
