use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{AgentContext, ControlReconciler};
use crate::config::Config;
use crate::domain::{energy, DeviceSlot};
use crate::hardware::{Actuator, Credentials, Link, Meter};
use crate::remote::{child_path, MonitorSnapshot, RemoteStore, SyncError, KWH_KEY, WH_KEY};

/// Timing and addressing for the cycle.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub publish_interval: Duration,
    pub settle: Duration,
    pub half_wavelengths: u32,
    pub sample_timeout: Duration,
    pub monitor_path: String,
    pub controller_path: String,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tick: cfg.scheduler.tick(),
            publish_interval: cfg.scheduler.publish_interval(),
            settle: cfg.scheduler.settle(),
            half_wavelengths: cfg.meter.half_wavelengths,
            sample_timeout: cfg.meter.timeout(),
            monitor_path: cfg.backend.monitor_path.clone(),
            controller_path: cfg.backend.controller_path.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            publish_interval: Duration::from_secs(1),
            settle: Duration::from_secs(10),
            half_wavelengths: 20,
            sample_timeout: Duration::from_secs(2),
            monitor_path: "/monitor".into(),
            controller_path: "/controller".into(),
        }
    }
}

/// Counters kept across the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub ticks: u64,
    pub slow_runs: u64,
    pub control_stale_reads: u64,
    pub energy_read_failures: u64,
    pub publish_failures: u64,
    pub last_publish: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CycleStats {
    fn record_error(&mut self, e: &SyncError) {
        self.last_error = Some(e.to_string());
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub slow_path_ran: bool,
    pub stale_control_slots: usize,
    pub published: bool,
}

/// Fixed-period loop: control reconciliation every tick, measurement and
/// publishing whenever the publish interval has elapsed and the backend is up.
pub struct CycleScheduler {
    settings: SchedulerSettings,
    ctx: AgentContext,
    reconciler: ControlReconciler,
    store: Arc<dyn RemoteStore>,
    meter: Box<dyn Meter>,
    actuator: Arc<dyn Actuator>,
}

impl CycleScheduler {
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<dyn RemoteStore>,
        meter: Box<dyn Meter>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        let reconciler = ControlReconciler::new(settings.controller_path.clone());
        Self {
            settings,
            ctx: AgentContext::new(Instant::now()),
            reconciler,
            store,
            meter,
            actuator,
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// One-time startup: outputs low, wait for the network, sign in to the
    /// backend, then let the session settle before the first tick.
    ///
    /// A failed sign-in is not fatal; `ready()` keeps retrying from the loop.
    pub async fn start(&mut self, link: &dyn Link, credentials: &Credentials) -> Result<()> {
        for slot in DeviceSlot::all() {
            self.actuator
                .set_line(slot, false)
                .await
                .with_context(|| format!("initialise {slot} output"))?;
        }

        if !link.connect(credentials).await {
            anyhow::bail!("network association with {} failed", credentials.ssid);
        }

        if let Err(e) = self.store.sign_in().await {
            warn!(error = %e, "backend sign-in failed, retrying from the cycle");
            self.ctx.stats.record_error(&e);
        }

        info!(settle_ms = self.settings.settle.as_millis() as u64, "waiting for backend to settle");
        sleep(self.settings.settle).await;
        Ok(())
    }

    /// Run ticks until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            tick_ms = self.settings.tick.as_millis() as u64,
            publish_ms = self.settings.publish_interval.as_millis() as u64,
            "cycle started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }

        let stats = &self.ctx.stats;
        info!(
            ticks = stats.ticks,
            slow_runs = stats.slow_runs,
            publish_failures = stats.publish_failures,
            device1 = self.ctx.control.get(DeviceSlot::Device1),
            device2 = self.ctx.control.get(DeviceSlot::Device2),
            device3 = self.ctx.control.get(DeviceSlot::Device3),
            kwh = self.ctx.energy.kwh,
            "cycle stopped"
        );
        Ok(())
    }

    /// Fast path always; slow path when due and the backend is ready.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        self.ctx.stats.ticks += 1;

        let stale = self
            .reconciler
            .reconcile(&mut self.ctx.control, self.store.as_ref(), self.actuator.as_ref())
            .await;
        self.ctx.stats.control_stale_reads += stale as u64;

        let mut report = TickReport {
            slow_path_ran: false,
            stale_control_slots: stale,
            published: false,
        };

        if self.ctx.clock.is_due(now, self.settings.publish_interval) && self.store.ready().await {
            report.slow_path_ran = true;
            report.published = self.slow_path(now).await;
        }
        report
    }

    async fn slow_path(&mut self, now: Instant) -> bool {
        self.ctx.stats.slow_runs += 1;
        self.refresh_energy_from_remote().await;

        let sample = self
            .meter
            .sample(self.settings.half_wavelengths, self.settings.sample_timeout);
        self.ctx.energy = energy::update(
            self.ctx.energy,
            &sample,
            self.settings.publish_interval.as_secs_f64(),
        );

        let snapshot = MonitorSnapshot::new(&sample, &self.ctx.energy);
        info!(
            vrms = snapshot.vrms,
            irms = snapshot.irms,
            apparent_power = snapshot.apparent_power,
            real_power = snapshot.real_power,
            power_factor = snapshot.power_factor,
            wh = snapshot.wh,
            kwh = snapshot.kwh,
            "measurement"
        );

        let published = match self
            .store
            .write_json(&self.settings.monitor_path, &snapshot)
            .await
        {
            Ok(()) => {
                self.ctx.stats.last_publish = Some(Utc::now());
                self.ctx.unpublished = false;
                true
            }
            Err(e) => {
                warn!(path = %self.settings.monitor_path, error = %e, "publish failed");
                self.ctx.unpublished = true;
                self.ctx.stats.publish_failures += 1;
                self.ctx.stats.record_error(&e);
                false
            }
        };

        self.ctx.clock.mark(now);
        published
    }

    /// Adopt the remote registers when they can be read; keep local values otherwise.
    ///
    /// While the last publish is outstanding the remote copy is older than the
    /// local one, so it is not read at all.
    async fn refresh_energy_from_remote(&mut self) {
        if self.ctx.unpublished {
            debug!(
                wh = self.ctx.energy.wh,
                kwh = self.ctx.energy.kwh,
                "last publish failed, keeping local registers"
            );
            return;
        }

        let kwh_path = child_path(&self.settings.monitor_path, KWH_KEY);
        let kwh = self.store.read_string(&kwh_path).await.and_then(|raw| {
            raw.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or(SyncError::Parse {
                    path: kwh_path.clone(),
                    expected: "number",
                })
        });
        match kwh {
            Ok(v) => self.ctx.energy.kwh = v,
            Err(e) => self.note_energy_read_failure(&kwh_path, e),
        }

        let wh_path = child_path(&self.settings.monitor_path, WH_KEY);
        match self.store.read_number(&wh_path).await {
            Ok(v) => self.ctx.energy.wh = v,
            Err(e) => self.note_energy_read_failure(&wh_path, e),
        }
    }

    fn note_energy_read_failure(&mut self, path: &str, e: SyncError) {
        self.ctx.stats.energy_read_failures += 1;
        if matches!(e, SyncError::Missing(_)) {
            debug!(%path, "no remote value yet, keeping local register");
            return;
        }
        if e.is_transient() {
            warn!(%path, error = %e, "energy read failed, keeping local register");
        } else {
            error!(%path, error = %e, "remote register is malformed, keeping local register");
        }
        self.ctx.stats.record_error(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MeasurementSample;
    use crate::hardware::SimulatedActuator;
    use crate::remote::MemoryStore;

    struct ConstantMeter(MeasurementSample);

    impl Meter for ConstantMeter {
        fn sample(&mut self, _half_wavelengths: u32, _timeout: Duration) -> MeasurementSample {
            self.0
        }
    }

    fn watts(p: f64) -> MeasurementSample {
        MeasurementSample {
            irms: p / 230.0,
            vrms: 230.0,
            apparent_power: p,
            real_power: p,
            power_factor: 1.0,
        }
    }

    fn scheduler(store: &MemoryStore, act: &SimulatedActuator, power: f64) -> CycleScheduler {
        CycleScheduler::new(
            SchedulerSettings::default(),
            Arc::new(store.clone()),
            Box::new(ConstantMeter(watts(power))),
            Arc::new(act.clone()),
        )
    }

    #[tokio::test]
    async fn test_slow_path_gated_by_elapsed_time() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;

        let r = sched.tick(t0 + Duration::from_millis(500)).await;
        assert!(!r.slow_path_ran);
        // Exactly one interval is not yet "more than" one interval
        let r = sched.tick(t0 + Duration::from_millis(1000)).await;
        assert!(!r.slow_path_ran);
        let r = sched.tick(t0 + Duration::from_millis(1001)).await;
        assert!(r.slow_path_ran && r.published);
        let r = sched.tick(t0 + Duration::from_millis(1500)).await;
        assert!(!r.slow_path_ran);

        assert_eq!(sched.context().stats.ticks, 4);
        assert_eq!(sched.context().stats.slow_runs, 1);
    }

    #[tokio::test]
    async fn test_slow_path_publishes_accumulated_energy() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;

        sched.tick(t0 + Duration::from_secs(2)).await;

        // 360 W for the nominal 1 s interval = 0.1 Wh
        assert_eq!(sched.context().energy.wh, 0.1);
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "/monitor");
        assert_eq!(writes[0].1.wh, 0.1);
        assert_eq!(writes[0].1.real_power, 360.0);
        assert_eq!(store.get("/monitor/kWh").unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_remote_registers_win_when_readable() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;

        store.set("/monitor/kWh", "12.5");
        store.set("/monitor/Wh", 0.95);
        sched.tick(t0 + Duration::from_secs(2)).await;

        // 0.95 + 0.1 carries into the remote kWh value
        assert_eq!(sched.context().energy.kwh, 12.501);
        assert_eq!(sched.context().energy.wh, 0.0);
    }

    #[tokio::test]
    async fn test_failed_energy_read_keeps_local_register() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;

        sched.tick(t0 + Duration::from_secs(2)).await;
        assert_eq!(sched.context().energy.wh, 0.1);

        // Remote copy diverges, but reads of Wh fail: local 0.1 carries on
        store.set("/monitor/Wh", 0.7);
        store.set("/monitor/kWh", "not a number");
        store.fail_reads("/monitor/Wh", true);
        sched.tick(t0 + Duration::from_secs(4)).await;

        assert_eq!(sched.context().energy.wh, 0.2);
        assert_eq!(sched.context().energy.kwh, 0.0);
        // Two misses on the empty store first, then the two failures above
        assert_eq!(sched.context().stats.energy_read_failures, 4);
    }

    #[tokio::test]
    async fn test_publish_failure_still_advances_clock() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;
        store.fail_writes(true);

        let now = t0 + Duration::from_secs(2);
        let r = sched.tick(now).await;
        assert!(r.slow_path_ran);
        assert!(!r.published);
        assert!(sched.context().unpublished);
        assert_eq!(sched.context().clock.last_slow_tick, now);
        assert_eq!(sched.context().stats.publish_failures, 1);
        assert!(sched.context().stats.last_error.is_some());
    }

    #[tokio::test]
    async fn test_unpublished_registers_are_not_replaced_by_stale_remote() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 360.0);
        let t0 = sched.context().clock.last_slow_tick;

        store.set("/monitor/kWh", "5.000");
        store.set("/monitor/Wh", 0.99);
        store.fail_writes(true);
        sched.tick(t0 + Duration::from_secs(2)).await;
        assert_eq!(sched.context().energy, crate::domain::EnergyState::new(0.0, 5.001));

        // Store still holds the pre-carry registers; nothing is read back
        store.fail_writes(false);
        let reads = store.read_count();
        let r = sched.tick(t0 + Duration::from_secs(4)).await;
        assert!(r.published);
        assert_eq!(store.read_count() - reads, 3);
        assert_eq!(sched.context().energy, crate::domain::EnergyState::new(0.1, 5.001));
        assert!(!sched.context().unpublished);
        assert_eq!(store.get("/monitor/kWh").unwrap(), 5.001);
    }

    #[tokio::test]
    async fn test_malformed_register_is_recorded() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 0.0);
        let t0 = sched.context().clock.last_slow_tick;

        store.set("/monitor/Wh", serde_json::json!({ "bad": true }));
        sched.tick(t0 + Duration::from_secs(2)).await;

        let stats = &sched.context().stats;
        assert_eq!(stats.energy_read_failures, 2);
        assert!(stats.last_error.as_deref().unwrap().contains("/monitor/Wh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_drives_lines_low_and_settles() {
        let store = MemoryStore::new();
        let act = SimulatedActuator::new();
        let mut sched = scheduler(&store, &act, 0.0);
        let link = crate::hardware::SimulatedLink::new(2);
        let creds = Credentials {
            ssid: "lab".into(),
            password: String::new(),
        };

        let started = Instant::now();
        sched.start(&link, &creds).await.unwrap();

        assert_eq!(act.write_count(), 3);
        assert!(!act.line(DeviceSlot::Device1));
        assert_eq!(started.elapsed(), Duration::from_secs(2) + Duration::from_secs(10));
    }
}
