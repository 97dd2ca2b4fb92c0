//! Single entry point for every record-capture screen.

use crate::connectivity::ConnectivityMonitor;
use crate::model::{RecordKind, SubmitOutcome};
use crate::queue::QueueStore;
use crate::remote::{self, RecordApi};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct SubmissionGateway {
    monitor: ConnectivityMonitor,
    queue: Arc<dyn QueueStore>,
    api: Arc<dyn RecordApi>,
    timeout: Duration,
}

impl SubmissionGateway {
    pub fn new(
        monitor: ConnectivityMonitor,
        queue: Arc<dyn QueueStore>,
        api: Arc<dyn RecordApi>,
        timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            queue,
            api,
            timeout,
        }
    }

    /// Deliver `payload` now if possible, otherwise queue it.
    ///
    /// Online is only a hint: a live attempt that fails for any reason falls
    /// back to the queue. The only error returned is a failure to persist,
    /// which means the observation was not captured.
    #[instrument(skip_all, fields(kind = %endpoint))]
    pub async fn submit(&self, endpoint: RecordKind, payload: Value) -> Result<SubmitOutcome> {
        // Chosen up front so a live attempt and its replay share a key.
        let id = Uuid::new_v4();

        if self.monitor.is_online() {
            let key = id.to_string();
            match remote::submit_with_timeout(&*self.api, endpoint, &payload, &key, self.timeout)
                .await
            {
                Ok(()) => {
                    info!(%id, "record submitted");
                    return Ok(SubmitOutcome::Submitted { id });
                }
                Err(err) => {
                    warn!(%err, %id, "live submission failed; queueing");
                }
            }
        }

        let entry = self
            .queue
            .append_with_id(id, endpoint, &payload)
            .await
            .with_context(|| format!("{endpoint} record was not captured"))?;
        Ok(SubmitOutcome::Queued(entry))
    }
}
