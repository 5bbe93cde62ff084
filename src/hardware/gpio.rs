use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::Actuator;
use crate::domain::{ControlState, DeviceSlot};

/// GPIO lines through the legacy sysfs interface (`/sys/class/gpio`).
pub struct SysfsGpio {
    root: PathBuf,
    pins: [u32; 3],
}

impl SysfsGpio {
    /// Export each pin if needed, set it as an output and drive it low.
    pub async fn open(root: &str, pins: [u32; 3]) -> Result<Self> {
        let gpio = Self {
            root: PathBuf::from(root),
            pins,
        };
        for pin in pins {
            let dir = gpio.pin_dir(pin);
            if tokio::fs::metadata(&dir).await.is_err() {
                tokio::fs::write(gpio.root.join("export"), pin.to_string())
                    .await
                    .with_context(|| format!("export gpio{pin}"))?;
            }
            // "low" sets the direction to output with the value already at 0
            tokio::fs::write(dir.join("direction"), "low")
                .await
                .with_context(|| format!("configure gpio{pin} as output"))?;
        }
        info!(?pins, "sysfs GPIO outputs ready");
        Ok(gpio)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }
}

#[async_trait]
impl Actuator for SysfsGpio {
    async fn set_line(&self, slot: DeviceSlot, on: bool) -> Result<()> {
        let pin = self.pins[slot.index()];
        let value = if on { "1" } else { "0" };
        tokio::fs::write(self.pin_dir(pin).join("value"), value)
            .await
            .with_context(|| format!("write gpio{pin}"))
    }
}

/// Output lines held in memory; clones share the same lines.
#[derive(Debug, Clone, Default)]
pub struct SimulatedActuator {
    lines: Arc<Mutex<ControlState>>,
    writes: Arc<Mutex<usize>>,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self, slot: DeviceSlot) -> bool {
        self.lines.lock().get(slot)
    }

    pub fn lines(&self) -> ControlState {
        *self.lines.lock()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn set_line(&self, slot: DeviceSlot, on: bool) -> Result<()> {
        let mut lines = self.lines.lock();
        if lines.get(slot) != on {
            debug!(%slot, on, "line changed");
        }
        lines.set(slot, on);
        *self.writes.lock() += 1;
        Ok(())
    }
}
