//! Shared agent state: configuration, connection policy and the sysinfo
//! handle, threaded through every task as one `Arc`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{watch, Mutex};

use crate::config::AgentConfig;
use crate::dialer::Dialer;
use crate::net_stats::{TrafficStore, DEFAULT_STORE_PATH};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AgentState {
    pub cfg: AgentConfig,
    pub dialer: Dialer,
    pub traffic: Arc<TrafficStore>,
    /// Persistent sysinfo handle so CPU usage deltas span ticks.
    pub sys: Mutex<System>,
    pub http: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl AgentState {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        let dialer = Dialer::new(&cfg.custom_dns, cfg.ignore_unsafe_cert)?;
        let http = dialer.http_client(HTTP_TIMEOUT);
        let store_path = std::env::var("HOSTBEAT_NET_STATE")
            .unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());
        let traffic = Arc::new(TrafficStore::new(store_path));

        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let mut sys = System::new_with_specifics(refresh);
        sys.refresh_specifics(refresh);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            cfg,
            dialer,
            traffic,
            sys: Mutex::new(sys),
            http,
            shutdown,
        })
    }

    /// Ask every connection-bound task to wind down.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}
