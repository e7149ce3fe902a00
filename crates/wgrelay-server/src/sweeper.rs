//! Liveness sweeper
//!
//! Agents heartbeat every 20 seconds. The sweeper wakes every 30 seconds and
//! evicts agents that have been silent for more than 60 — at least two missed
//! heartbeats, worst-case detection 90 seconds after the last one.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::Registry;

/// How often the sweeper scans the agent table.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which an agent is considered dead.
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(60);

/// Run the sweeper until the process exits.
pub fn spawn(registry: Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // The immediate first tick would sweep an empty table.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = registry.evict_stale(HEARTBEAT_DEADLINE).await;
            if evicted > 0 {
                debug!(evicted, "liveness sweep evicted dead agents");
            }
        }
    })
}

/// Humanize an idle duration for eviction log lines.
pub(crate) fn format_idle(idle: Duration) -> String {
    let total = idle.as_secs();
    if total < 1 {
        return "less than 1 second".to_string();
    }

    let (minutes, seconds) = (total / 60, total % 60);
    let mut parts = Vec::new();
    if minutes > 0 {
        parts.push(format!(
            "{minutes} minute{}",
            if minutes == 1 { "" } else { "s" }
        ));
    }
    if seconds > 0 {
        parts.push(format!(
            "{seconds} second{}",
            if seconds == 1 { "" } else { "s" }
        ));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_idle_durations() {
        assert_eq!(format_idle(Duration::from_millis(300)), "less than 1 second");
        assert_eq!(format_idle(Duration::from_secs(1)), "1 second");
        assert_eq!(format_idle(Duration::from_secs(45)), "45 seconds");
        assert_eq!(format_idle(Duration::from_secs(60)), "1 minute");
        assert_eq!(format_idle(Duration::from_secs(61)), "1 minute 1 second");
        assert_eq!(format_idle(Duration::from_secs(154)), "2 minutes 34 seconds");
    }
}
