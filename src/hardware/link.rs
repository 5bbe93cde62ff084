use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use super::Link;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

async fn wait_for_link<L: Link + ?Sized>(link: &L, credentials: &Credentials) {
    info!(ssid = %credentials.ssid, "connecting to network");
    let mut polls = 0u32;
    while !link.is_connected().await {
        polls += 1;
        debug!(polls, "waiting for network");
        sleep(POLL_INTERVAL).await;
    }
    info!(polls, "network connected");
}

/// Host networking, considered up once `probe` accepts a TCP connection.
///
/// Without a probe address the host network is assumed to be up.
pub struct HostLink {
    probe: Option<String>,
}

impl HostLink {
    pub fn new(probe: Option<String>) -> Self {
        Self { probe }
    }

    /// `host:443` for an `https://host/...` URL. Only http(s) URLs yield a probe.
    pub fn probe_for_url(url: &str) -> Option<String> {
        let url = reqwest::Url::parse(url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }
}

#[async_trait]
impl Link for HostLink {
    async fn connect(&self, credentials: &Credentials) -> bool {
        wait_for_link(self, credentials).await;
        true
    }

    async fn is_connected(&self) -> bool {
        let Some(addr) = &self.probe else {
            return true;
        };
        matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(addr.as_str())).await,
            Ok(Ok(_))
        )
    }
}

/// Link that associates after a fixed number of polls and can be dropped at will.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    polls_until_up: Arc<AtomicU32>,
    forced_down: Arc<AtomicBool>,
}

impl SimulatedLink {
    pub fn new(polls_until_up: u32) -> Self {
        Self {
            polls_until_up: Arc::new(AtomicU32::new(polls_until_up)),
            forced_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.forced_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Link for SimulatedLink {
    async fn connect(&self, credentials: &Credentials) -> bool {
        wait_for_link(self, credentials).await;
        true
    }

    async fn is_connected(&self) -> bool {
        if self.forced_down.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = self.polls_until_up.load(Ordering::SeqCst);
        if remaining == 0 {
            return true;
        }
        self.polls_until_up.store(remaining - 1, Ordering::SeqCst);
        false
    }
}
