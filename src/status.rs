use crate::connectivity::ConnectivityMonitor;
use crate::model::SyncStatus;
use crate::queue::QueueStore;
use crate::reconciler::SyncReconciler;
use std::sync::Arc;

/// Read-only projection of sync state for the presentation layer.
pub struct StatusAggregator {
    monitor: ConnectivityMonitor,
    queue: Arc<dyn QueueStore>,
    reconciler: Arc<SyncReconciler>,
}

impl StatusAggregator {
    pub fn new(
        monitor: ConnectivityMonitor,
        queue: Arc<dyn QueueStore>,
        reconciler: Arc<SyncReconciler>,
    ) -> Self {
        Self {
            monitor,
            queue,
            reconciler,
        }
    }

    pub async fn get_status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.monitor.is_online(),
            pending_count: self.queue.count().await,
            is_syncing: self.reconciler.is_syncing(),
            // Persisted by the reconciler after any pass with a success.
            last_synced_at: self.queue.last_synced_at().await,
            last_pass: self.reconciler.last_pass().await,
        }
    }
}
