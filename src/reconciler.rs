//! Replays queued records against the remote API.

use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::model::ReconcileSummary;
use crate::queue::QueueStore;
use crate::remote::{self, RecordApi};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub struct SyncReconciler {
    queue: Arc<dyn QueueStore>,
    api: Arc<dyn RecordApi>,
    timeout: Duration,
    running: AtomicBool,
    rerun: AtomicBool,
    last_pass: RwLock<Option<ReconcileSummary>>,
}

/// Clears the running flag even if a pass unwinds.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncReconciler {
    pub fn new(queue: Arc<dyn QueueStore>, api: Arc<dyn RecordApi>, timeout: Duration) -> Self {
        Self {
            queue,
            api,
            timeout,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            last_pass: RwLock::new(None),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn last_pass(&self) -> Option<ReconcileSummary> {
        self.last_pass.read().await.clone()
    }

    /// Drain the pending queue once.
    ///
    /// If a pass is already running this returns `None` straight away and the
    /// running call performs one more pass when it finishes. Otherwise the
    /// summary covers every pass this call ran.
    pub async fn reconcile(&self) -> Option<ReconcileSummary> {
        let mut guard = match PassGuard::acquire(&self.running) {
            Some(guard) => guard,
            None => {
                self.rerun.store(true, Ordering::Release);
                // The holder may have released between our two steps.
                match PassGuard::acquire(&self.running) {
                    Some(guard) => guard,
                    None => {
                        debug!("sync pass already running; request coalesced");
                        return None;
                    }
                }
            }
        };
        self.rerun.store(false, Ordering::Release);

        let mut total: Option<ReconcileSummary> = None;
        loop {
            let pass = self.run_pass().await;
            match total.as_mut() {
                Some(t) => t.absorb(&pass),
                None => total = Some(pass),
            }
            if self.rerun.swap(false, Ordering::AcqRel) {
                continue;
            }
            drop(guard);
            if !self.rerun.load(Ordering::Acquire) {
                break;
            }
            match PassGuard::acquire(&self.running) {
                Some(next) => {
                    guard = next;
                    self.rerun.store(false, Ordering::Release);
                }
                None => break,
            }
        }

        let total = total?;
        *self.last_pass.write().await = Some(total.clone());
        Some(total)
    }

    /// Attempt every entry pending at the start of the pass exactly once.
    #[instrument(skip_all)]
    async fn run_pass(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::started(Utc::now());
        let pending = self.queue.list_pending().await;
        if pending.is_empty() {
            summary.finished_at = Utc::now();
            return summary;
        }
        info!(pending = pending.len(), "sync pass started");

        for entry in pending {
            summary.attempted += 1;
            let key = entry.id.to_string();
            let res = remote::submit_with_timeout(
                &*self.api,
                entry.endpoint,
                &entry.payload,
                &key,
                self.timeout,
            )
            .await;
            match res {
                Ok(()) => {
                    self.queue.mark_synced(entry.id).await;
                    summary.succeeded += 1;
                    debug!(id = %entry.id, kind = %entry.endpoint, "entry synced");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        %err,
                        id = %entry.id,
                        kind = %entry.endpoint,
                        attempts = entry.attempts + 1,
                        "entry sync failed; left pending"
                    );
                    self.queue.record_failure(entry.id, &err.to_string()).await;
                }
            }
        }

        summary.finished_at = Utc::now();
        if summary.succeeded > 0 {
            self.queue.set_last_synced_at(summary.finished_at).await;
        }
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "sync pass finished"
        );
        summary
    }
}

/// Background task reconciling on every transition to online.
#[derive(Debug)]
pub struct AutoSync {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl AutoSync {
    /// Stop listening; a pass in progress is allowed to finish.
    pub async fn shutdown(self) {
        drop(self.subscription);
        let _ = self.task.await;
    }
}

pub fn spawn_auto_sync(monitor: &ConnectivityMonitor, reconciler: Arc<SyncReconciler>) -> AutoSync {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = monitor.subscribe(move |state| {
        if state.is_online() {
            let _ = tx.send(());
        }
    });
    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Some(summary) = reconciler.reconcile().await {
                if summary.attempted > 0 {
                    info!(%summary, "sync after reconnect");
                }
            }
        }
    });
    AutoSync { subscription, task }
}
