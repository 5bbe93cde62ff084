use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};
use validator::Validate;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    pub wifi: WifiConfig,
    #[validate(nested)]
    pub backend: BackendConfig,
    #[validate(nested)]
    pub meter: MeterConfig,
    #[validate(nested)]
    pub actuator: ActuatorConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendProvider {
    Memory,
    Firebase,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BackendConfig {
    pub provider: BackendProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_identity_url")]
    pub identity_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[validate(range(min = 1))]
    pub http_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub max_token_retries: u32,
    #[validate(length(min = 1))]
    pub monitor_path: String,
    #[validate(length(min = 1))]
    pub controller_path: String,
}

fn default_identity_url() -> String {
    "https://identitytoolkit.googleapis.com".into()
}

fn default_token_url() -> String {
    "https://securetoken.googleapis.com".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceMode {
    Simulated,
    /// Linux IIO for the ADC, sysfs for GPIO.
    Linux,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MeterConfig {
    pub mode: DeviceMode,
    /// IIO device directory, e.g. `/sys/bus/iio/devices/iio:device0`.
    #[serde(default)]
    pub iio_device: String,
    pub current_channel: u32,
    pub voltage_channel: u32,
    pub current_calibration: f64,
    pub voltage_calibration: f64,
    pub phase_calibration: f64,
    #[validate(range(min = 1))]
    pub half_wavelengths: u32,
    #[validate(range(min = 1))]
    pub timeout_millis: u64,
    #[validate(range(min = 8, max = 16))]
    pub adc_bits: u32,
    pub supply_millivolts: u32,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl MeterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

/// Waveform fed to the simulated ADC.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    pub mains_voltage_rms: f64,
    pub load_current_rms: f64,
    /// Current lags voltage by this many degrees.
    pub phase_lag_degrees: f64,
    pub noise_counts: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mains_voltage_rms: 230.0,
            load_current_rms: 0.5,
            phase_lag_degrees: 15.0,
            noise_counts: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ActuatorConfig {
    pub mode: DeviceMode,
    #[serde(default = "default_gpio_root")]
    pub gpio_root: String,
    /// Physical output for device1, device2, device3 in that order.
    #[validate(length(equal = 3))]
    pub pins: Vec<u32>,
}

fn default_gpio_root() -> String {
    "/sys/class/gpio".into()
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SchedulerConfig {
    #[validate(range(min = 1))]
    pub tick_millis: u64,
    #[validate(range(min = 1))]
    pub publish_interval_millis: u64,
    pub settle_millis: u64,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_millis)
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PMA__").split("__"));
        let cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.validate().context("configuration out of range")?;
        Ok(cfg)
    }
}
