//! Remote key-path store the agent mirrors its readings into and takes its
//! control commands from.

pub mod firebase;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{EnergyState, MeasurementSample};

pub use firebase::RtdbClient;
pub use memory::MemoryStore;

/// Child key of the sub-unit register inside the monitor document.
pub const WH_KEY: &str = "Wh";
/// Child key of the large-unit register inside the monitor document.
pub const KWH_KEY: &str = "kWh";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("backend session not ready")]
    NotReady,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status} for {path}")]
    Http { status: u16, path: String },
    #[error("no value at {0}")]
    Missing(String),
    #[error("value at {path} is not a {expected}")]
    Parse { path: String, expected: &'static str },
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SyncError {
    /// Network or session trouble that the next tick may clear on its own, as
    /// opposed to a value that is absent or malformed at the source.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NotReady | SyncError::Transport(_) | SyncError::Http { .. } | SyncError::Auth(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

/// The seven-field document published once per slow tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    #[serde(rename = "Irms")]
    pub irms: f64,
    #[serde(rename = "Vrms")]
    pub vrms: f64,
    #[serde(rename = "apparentPower")]
    pub apparent_power: f64,
    #[serde(rename = "realPower")]
    pub real_power: f64,
    #[serde(rename = "powerFactor")]
    pub power_factor: f64,
    #[serde(rename = "Wh")]
    pub wh: f64,
    #[serde(rename = "kWh")]
    pub kwh: f64,
}

impl MonitorSnapshot {
    /// Measurements at publish precision alongside the energy registers as accumulated.
    pub fn new(sample: &MeasurementSample, energy: &EnergyState) -> Self {
        let r = sample.rounded();
        Self {
            irms: r.irms,
            vrms: r.vrms,
            apparent_power: r.apparent_power,
            real_power: r.real_power,
            power_factor: r.power_factor,
            wh: energy.wh,
            kwh: energy.kwh,
        }
    }
}

/// Join a document path and a child key: `/monitor` + `Wh` -> `/monitor/Wh`.
pub fn child_path(parent: &str, key: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), key)
}

/// Read a scalar as text. Numbers are rendered the way JSON writes them.
pub(crate) fn value_as_string(path: &str, value: &Value) -> Result<String, SyncError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Err(SyncError::Missing(path.to_string())),
        _ => Err(SyncError::Parse {
            path: path.to_string(),
            expected: "string",
        }),
    }
}

/// Read a scalar as a number. Numeric strings are accepted.
pub(crate) fn value_as_number(path: &str, value: &Value) -> Result<f64, SyncError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Null => return Err(SyncError::Missing(path.to_string())),
        _ => None,
    };
    parsed.ok_or_else(|| SyncError::Parse {
        path: path.to_string(),
        expected: "number",
    })
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open the backend session once the network is up. Stores without a
    /// session have nothing to do.
    async fn sign_in(&self) -> Result<(), SyncError> {
        Ok(())
    }
    /// Whether the session can serve requests right now. May refresh credentials.
    async fn ready(&self) -> bool;
    async fn read_string(&self, path: &str) -> Result<String, SyncError>;
    async fn read_number(&self, path: &str) -> Result<f64, SyncError>;
    async fn write_json(&self, path: &str, snapshot: &MonitorSnapshot) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_wire_names() {
        let snapshot = MonitorSnapshot::new(
            &MeasurementSample {
                irms: 0.43219,
                vrms: 231.456,
                apparent_power: 100.0,
                real_power: 95.123,
                power_factor: 0.951,
            },
            &EnergyState::new(0.1234, 12.345),
        );
        let value = serde_json::to_value(snapshot).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["Irms", "Vrms", "Wh", "apparentPower", "kWh", "powerFactor", "realPower"]
        );
        assert_eq!(obj["Irms"], 0.4322);
        assert_eq!(obj["Vrms"], 231.46);
        assert_eq!(obj["realPower"], 95.12);
        assert_eq!(obj["Wh"], 0.1234);
        assert_eq!(obj["kWh"], 12.345);
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/monitor", WH_KEY), "/monitor/Wh");
        assert_eq!(child_path("/monitor/", KWH_KEY), "/monitor/kWh");
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(value_as_string("/a", &serde_json::json!("1")).unwrap(), "1");
        assert_eq!(value_as_string("/a", &serde_json::json!(0)).unwrap(), "0");
        assert!(matches!(
            value_as_string("/a", &Value::Null),
            Err(SyncError::Missing(_))
        ));
        assert_eq!(value_as_number("/a", &serde_json::json!(0.25)).unwrap(), 0.25);
        assert_eq!(value_as_number("/a", &serde_json::json!(" 3.5 ")).unwrap(), 3.5);
        assert!(matches!(
            value_as_number("/a", &serde_json::json!("abc")),
            Err(SyncError::Parse { .. })
        ));
        assert!(matches!(
            value_as_number("/a", &serde_json::json!("NaN")),
            Err(SyncError::Parse { .. })
        ));
        assert!(matches!(
            value_as_number("/a", &serde_json::json!({"k": 1})),
            Err(SyncError::Parse { .. })
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::NotReady.is_transient());
        assert!(SyncError::Transport("reset".into()).is_transient());
        assert!(!SyncError::Missing("/x".into()).is_transient());
        assert!(!SyncError::Parse { path: "/x".into(), expected: "number" }.is_transient());
    }
}
