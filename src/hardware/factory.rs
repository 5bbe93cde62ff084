use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use super::{
    Actuator, Calibration, EmonCalculator, HostLink, IioAdc, Link, Meter, SimulatedActuator,
    SimulatedAdc, SimulatedLink, SysfsGpio,
};
use crate::config::{BackendProvider, Config, DeviceMode};
use crate::remote::{MemoryStore, RemoteStore, RtdbClient};

/// Everything the agent talks to outside its own state.
pub struct Devices {
    pub link: Box<dyn Link>,
    pub store: Arc<dyn RemoteStore>,
    pub meter: Box<dyn Meter>,
    pub actuator: Arc<dyn Actuator>,
}

/// Builds device instances for the configured modes.
pub struct DeviceFactory {
    config: Config,
}

impl DeviceFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn build(&self) -> Result<Devices> {
        Ok(Devices {
            link: self.create_link(),
            store: self.create_store()?,
            meter: self.create_meter()?,
            actuator: self.create_actuator().await?,
        })
    }

    pub fn create_link(&self) -> Box<dyn Link> {
        match self.config.backend.provider {
            BackendProvider::Memory => Box::new(SimulatedLink::new(0)),
            BackendProvider::Firebase => Box::new(HostLink::new(HostLink::probe_for_url(
                &self.config.backend.database_url,
            ))),
        }
    }

    pub fn create_store(&self) -> Result<Arc<dyn RemoteStore>> {
        let backend = &self.config.backend;
        match backend.provider {
            BackendProvider::Memory => {
                info!("using in-memory backend");
                Ok(Arc::new(MemoryStore::new()))
            }
            BackendProvider::Firebase => {
                if backend.database_url.is_empty() {
                    anyhow::bail!("backend.database_url must be set for the firebase provider");
                }
                info!(url = %backend.database_url, "using Firebase realtime database");
                Ok(Arc::new(RtdbClient::new(backend)?))
            }
        }
    }

    pub fn create_meter(&self) -> Result<Box<dyn Meter>> {
        let meter = &self.config.meter;
        let cal = Calibration::from_config(meter);
        match meter.mode {
            DeviceMode::Simulated => {
                info!(
                    vrms = meter.simulation.mains_voltage_rms,
                    irms = meter.simulation.load_current_rms,
                    "using simulated meter"
                );
                Ok(Box::new(EmonCalculator::new(
                    SimulatedAdc::new(&meter.simulation, &cal),
                    cal,
                )))
            }
            DeviceMode::Linux => {
                let adc = IioAdc::new(&meter.iio_device, meter.voltage_channel, meter.current_channel)
                    .with_context(|| format!("open IIO device {}", meter.iio_device))?;
                info!(device = %meter.iio_device, "using IIO meter");
                Ok(Box::new(EmonCalculator::new(adc, cal)))
            }
        }
    }

    pub async fn create_actuator(&self) -> Result<Arc<dyn Actuator>> {
        let act = &self.config.actuator;
        match act.mode {
            DeviceMode::Simulated => Ok(Arc::new(SimulatedActuator::new())),
            DeviceMode::Linux => {
                let pins: [u32; 3] = act
                    .pins
                    .as_slice()
                    .try_into()
                    .context("actuator.pins must list exactly three outputs")?;
                Ok(Arc::new(SysfsGpio::open(&act.gpio_root, pins).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG_PATH;
    use std::path::Path;

    fn default_config() -> Config {
        Config::load_from(Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)).unwrap()
    }

    #[tokio::test]
    async fn test_factory_builds_simulated_devices() {
        let factory = DeviceFactory::new(default_config());
        let mut devices = factory.build().await.unwrap();

        assert!(devices.link.is_connected().await);
        assert!(devices.store.ready().await);
        let sample = devices.meter.sample(20, std::time::Duration::from_secs(2));
        assert!(sample.vrms > 200.0);
    }

    #[tokio::test]
    async fn test_firebase_without_url_is_rejected() {
        let mut cfg = default_config();
        cfg.backend.provider = BackendProvider::Firebase;
        cfg.backend.database_url.clear();
        assert!(DeviceFactory::new(cfg).create_store().is_err());
    }

    #[tokio::test]
    async fn test_linux_meter_without_iio_device_fails() {
        let mut cfg = default_config();
        cfg.meter.mode = DeviceMode::Linux;
        cfg.meter.iio_device = "/nonexistent/iio:device9".into();
        assert!(DeviceFactory::new(cfg).create_meter().is_err());
    }
}
