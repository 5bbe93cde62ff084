use serde::{Deserialize, Serialize};

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// One reading from the metering primitive for a single measurement window.
///
/// Values are kept exactly as the primitive reported them. Use [`MeasurementSample::rounded`]
/// for the precision that gets published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub irms: f64,
    pub vrms: f64,
    pub apparent_power: f64,
    /// Signed; negative when power flows back through the clamp.
    pub real_power: f64,
    pub power_factor: f64,
}

impl MeasurementSample {
    /// Irms to 4 decimals, everything else to 2.
    pub fn rounded(&self) -> Self {
        Self {
            irms: round_to(self.irms, 4),
            vrms: round_to(self.vrms, 2),
            apparent_power: round_to(self.apparent_power, 2),
            real_power: round_to(self.real_power, 2),
            power_factor: round_to(self.power_factor, 2),
        }
    }
}
