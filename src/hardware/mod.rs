pub mod emon;
pub mod factory;
pub mod gpio;
pub mod link;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{DeviceSlot, MeasurementSample};

pub use emon::{AdcSource, Calibration, EmonCalculator, IioAdc, SimulatedAdc};
pub use factory::{DeviceFactory, Devices};
pub use gpio::{SimulatedActuator, SysfsGpio};
pub use link::{Credentials, HostLink, SimulatedLink};

/// Metering primitive: one blocking measurement window per call.
///
/// Whatever the window produced is returned, including a partial window cut
/// short by `timeout`.
pub trait Meter: Send {
    fn sample(&mut self, half_wavelengths: u32, timeout: Duration) -> MeasurementSample;
}

/// Binary output driver with one line per device slot.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn set_line(&self, slot: DeviceSlot, on: bool) -> Result<()>;
}

/// Network link the backend session rides on.
#[async_trait]
pub trait Link: Send + Sync {
    /// Blocks until associated. Returns `false` only if association is impossible.
    async fn connect(&self, credentials: &Credentials) -> bool;
    async fn is_connected(&self) -> bool;
}
