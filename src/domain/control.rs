use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// One of the three remotely controlled output slots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceSlot {
    Device1,
    Device2,
    Device3,
}

impl DeviceSlot {
    /// Slots in reconciliation order.
    pub fn all() -> impl Iterator<Item = DeviceSlot> {
        DeviceSlot::iter()
    }

    pub fn index(self) -> usize {
        match self {
            DeviceSlot::Device1 => 0,
            DeviceSlot::Device2 => 1,
            DeviceSlot::Device3 => 2,
        }
    }

    /// Remote path of this slot under `prefix`, e.g. `/controller/device2`.
    pub fn path(self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self)
    }
}

/// Desired on/off state of each slot as last read from the remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    slots: [bool; 3],
}

impl ControlState {
    pub fn get(&self, slot: DeviceSlot) -> bool {
        self.slots[slot.index()]
    }

    pub fn set(&mut self, slot: DeviceSlot, on: bool) {
        self.slots[slot.index()] = on;
    }
}

/// Interpret a remote control value.
///
/// Leading whitespace and one sign are skipped, then the leading decimal digits
/// are taken. Anything non-zero is on. No digits at all reads as zero.
pub fn parse_control_value(raw: &str) -> bool {
    let s = raw.trim_start();
    let s = s.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(s);
    s.chars()
        .take_while(|c| c.is_ascii_digit())
        .any(|c| c != '0')
}
