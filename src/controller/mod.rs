pub mod reconciler;
pub mod scheduler;

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::domain::{ControlState, EnergyState};
use crate::hardware::{Credentials, DeviceFactory};

pub use reconciler::ControlReconciler;
pub use scheduler::{CycleScheduler, CycleStats, SchedulerSettings, TickReport};

/// Tracks when the slow path last ran.
#[derive(Debug, Clone, Copy)]
pub struct CycleClock {
    pub last_slow_tick: Instant,
}

impl CycleClock {
    pub fn new(start: Instant) -> Self {
        Self {
            last_slow_tick: start,
        }
    }

    /// Strictly more than `interval` since the last slow tick.
    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_slow_tick) > interval
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_slow_tick = now;
    }
}

/// All mutable agent state, owned by the scheduler for the process lifetime.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub energy: EnergyState,
    pub control: ControlState,
    pub clock: CycleClock,
    pub stats: CycleStats,
    /// Local registers hold energy the store has not accepted yet.
    pub unpublished: bool,
}

impl AgentContext {
    pub fn new(start: Instant) -> Self {
        Self {
            energy: EnergyState::default(),
            control: ControlState::default(),
            clock: CycleClock::new(start),
            stats: CycleStats::default(),
            unpublished: false,
        }
    }
}

/// Build the configured devices, bring the link up and run the cycle until `shutdown`.
pub async fn run_agent<F>(cfg: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let devices = DeviceFactory::new(cfg.clone()).build().await?;
    let credentials = Credentials {
        ssid: cfg.wifi.ssid.clone(),
        password: cfg.wifi.password.clone(),
    };

    let mut scheduler = CycleScheduler::new(
        SchedulerSettings::from_config(&cfg),
        devices.store,
        devices.meter,
        devices.actuator,
    );

    tokio::pin!(shutdown);
    tokio::select! {
        res = scheduler.start(devices.link.as_ref(), &credentials) => res?,
        _ = &mut shutdown => {
            info!("shutdown requested during startup");
            return Ok(());
        }
    }
    scheduler.run(shutdown).await
}
