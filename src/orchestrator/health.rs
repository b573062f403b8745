// =============================================================================
// Health monitor — per-symbol liveness, memory and persistence backlog
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

/// A symbol with no closed bar for this long is reported stale. Sized for
/// M15 plus delivery delays.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 1200;

/// Memory ceiling before the report flags the process.
const MEMORY_WARN_MB: f64 = 1000.0;

/// Retry-queue depth that indicates the store has been down a while.
const PENDING_WARN: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub memory_mb: f64,
    pub uptime_s: f64,
}

pub struct HealthMonitor {
    heartbeats: RwLock<HashMap<String, Instant>>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            heartbeats: RwLock::new(HashMap::new()),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Record a closed bar for a symbol.
    pub fn update(&self, symbol: &str) {
        self.heartbeats
            .write()
            .insert(symbol.to_string(), Instant::now());
    }

    pub fn reset_symbol(&self, symbol: &str) {
        self.heartbeats.write().remove(symbol);
    }

    /// Evaluate overall health from the caller-supplied facts plus the
    /// monitor's own liveness and memory probes.
    pub fn check(
        &self,
        connector_connected: bool,
        pending_writes: usize,
        uptime_s: f64,
    ) -> HealthReport {
        let mut issues = Vec::new();

        if !connector_connected {
            issues.push("connector disconnected".to_string());
        }

        for (symbol, last) in self.heartbeats.read().iter() {
            let elapsed = last.elapsed().as_secs();
            if elapsed > HEARTBEAT_TIMEOUT_SECS {
                issues.push(format!("{symbol}: no bars for {elapsed}s"));
            }
        }

        let memory_mb = self.memory_mb();
        if memory_mb > MEMORY_WARN_MB {
            issues.push(format!("high memory: {memory_mb:.0}MB"));
        }

        if pending_writes > PENDING_WARN {
            issues.push(format!("persistence backlog: {pending_writes} writes"));
        }

        if !issues.is_empty() {
            warn!(?issues, "health check found issues");
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
            memory_mb: (memory_mb * 10.0).round() / 10.0,
            uptime_s: uptime_s.round(),
        }
    }

    fn memory_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0)
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
