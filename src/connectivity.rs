//! Online/offline tracking with transition subscribers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Listener = Arc<dyn Fn(Connectivity) + Send + Sync>;

struct Inner {
    state: Mutex<Connectivity>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
}

/// Best-known connectivity state. Cloning shares the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.current_state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(initial),
                listeners: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn current_state(&self) -> Connectivity {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_online(&self) -> bool {
        self.current_state().is_online()
    }

    /// Apply a platform reachability event. Subscribers are told only about
    /// actual transitions. Returns whether the state changed.
    pub fn set_state(&self, next: Connectivity) -> bool {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return false;
            }
            *state = next;
        }
        info!(state = %next, "connectivity changed");

        // Listeners run outside the lock so they may query the monitor.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(next);
        }
        true
    }

    /// Apply a probe result. Detection errors count as offline.
    pub fn observe(&self, probe: Result<bool>) -> bool {
        let next = match probe {
            Ok(true) => Connectivity::Online,
            Ok(false) => Connectivity::Offline,
            Err(err) => {
                debug!(?err, "connectivity probe failed; assuming offline");
                Connectivity::Offline
            }
        };
        self.set_state(next)
    }

    /// Register `listener` for every transition until the returned handle is
    /// dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Disposer returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    monitor: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// Source of reachability observations.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<bool>;
}

/// Considers the device online when the API health endpoint answers 2xx.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(base_url: &str, health_path: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(base_url)
            .context("invalid API base URL")?
            .join(health_path.trim_start_matches('/'))
            .context("invalid health path")?;
        let http = Client::builder()
            .user_agent(concat!("farm-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<bool> {
        let res = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .context("health check unreachable")?;
        Ok(res.status().is_success())
    }
}

/// Poll `probe` forever, feeding every result into `monitor`.
pub async fn run_probe_loop(
    monitor: ConnectivityMonitor,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
) {
    loop {
        let result = probe.probe().await;
        if let Err(err) = &result {
            if monitor.is_online() {
                warn!(?err, "lost connectivity");
            }
        }
        monitor.observe(result);
        tokio::time::sleep(interval).await;
    }
}
