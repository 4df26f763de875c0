//! NAT port-mapping refresh task
//!
//! Port mapping itself (UPnP, NAT-PMP, router scripts) is an injected
//! side-effect: the node supplies a `PortMapper` and this task re-applies
//! the mapping on a fixed cadence so router lease expiry cannot silently
//! unpublish the listen port. Nothing here touches blockchain or peer
//! state.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Refresh cadence. Router leases are commonly an hour; half that keeps
/// the mapping alive through one missed attempt.
const NAT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// External port-mapping side effect supplied by the embedder.
pub trait PortMapper: Send + Sync + 'static {
    /// Ensure an external mapping for `port` exists. Returns false when
    /// the refresh failed (logged, retried next cycle).
    fn refresh(&self, port: u16) -> bool;
    /// Best-effort removal at shutdown.
    fn remove(&self, port: u16);
}

pub struct NatManager {
    task: Option<JoinHandle<()>>,
    mapper: std::sync::Arc<dyn PortMapper>,
    port: u16,
}

impl NatManager {
    pub fn start(mapper: std::sync::Arc<dyn PortMapper>, port: u16) -> Self {
        let task_mapper = mapper.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NAT_REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                if task_mapper.refresh(port) {
                    debug!(port, "refreshed NAT mapping");
                } else {
                    warn!(port, "NAT mapping refresh failed");
                }
            }
        });
        Self { task: Some(task), mapper, port }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.mapper.remove(self.port);
    }
}

impl Drop for NatManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeMapper {
        refreshes: AtomicU32,
        removed: AtomicBool,
    }

    impl PortMapper for FakeMapper {
        fn refresh(&self, _port: u16) -> bool {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn remove(&self, _port: u16) {
            self.removed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_refresh_fires_immediately_and_removes_on_stop() {
        let mapper = Arc::new(FakeMapper {
            refreshes: AtomicU32::new(0),
            removed: AtomicBool::new(false),
        });
        let mut nat = NatManager::start(mapper.clone(), 18388);

        // interval() fires its first tick immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mapper.refreshes.load(Ordering::SeqCst) >= 1);

        nat.stop();
        assert!(mapper.removed.load(Ordering::SeqCst));
    }
}
