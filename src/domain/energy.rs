use serde::{Deserialize, Serialize};

use super::measurement::{round_to, MeasurementSample};

const SECONDS_PER_HOUR: f64 = 3600.0;
/// Whole Wh at which the register is carried into kWh.
pub const WH_CARRY_THRESHOLD: f64 = 1.0;
pub const KWH_PER_WH: f64 = 0.001;
const WH_DECIMALS: i32 = 4;
const KWH_DECIMALS: i32 = 3;

/// Energy registers. `kwh` only ever grows through a carry; `wh` returns to zero on each carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyState {
    pub wh: f64,
    pub kwh: f64,
}

impl EnergyState {
    pub fn new(wh: f64, kwh: f64) -> Self {
        Self { wh, kwh }
    }

    pub fn accumulate(self, sample: &MeasurementSample, elapsed_seconds: f64) -> Self {
        update(self, sample, elapsed_seconds)
    }
}

/// Integrate `sample.real_power` over `elapsed_seconds` into `prior`.
///
/// Both registers are rounded at every step and the carry test runs on the
/// rounded Wh value, so the result matches what gets persisted bit for bit.
/// Power is integrated as reported, negative values included.
pub fn update(prior: EnergyState, sample: &MeasurementSample, elapsed_seconds: f64) -> EnergyState {
    let wh = round_to(
        prior.wh + sample.real_power * elapsed_seconds / SECONDS_PER_HOUR,
        WH_DECIMALS,
    );

    if wh >= WH_CARRY_THRESHOLD {
        EnergyState {
            wh: 0.0,
            kwh: round_to(prior.kwh + wh * KWH_PER_WH, KWH_DECIMALS),
        }
    } else {
        EnergyState { wh, kwh: prior.kwh }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at_power(watts: f64) -> MeasurementSample {
        MeasurementSample {
            real_power: watts,
            ..Default::default()
        }
    }

    #[test]
    fn test_hundred_watts_for_36_seconds_carries_immediately() {
        let next = update(EnergyState::default(), &at_power(100.0), 36.0);
        assert_eq!(next.wh, 0.0);
        assert_eq!(next.kwh, 0.001);
    }

    #[test]
    fn test_below_threshold_accumulates_rounded_wh() {
        // 250 W for one second = 0.069444.. Wh
        let next = update(EnergyState::default(), &at_power(250.0), 1.0);
        assert_eq!(next.wh, 0.0694);
        assert_eq!(next.kwh, 0.0);

        let next = update(next, &at_power(250.0), 1.0);
        assert_eq!(next.wh, 0.1388);
    }

    #[test]
    fn test_rounding_happens_before_threshold_check() {
        // 0.99996 rounds up to 1.0000, which must carry
        let prior = EnergyState::new(0.9999, 2.5);
        let next = update(prior, &at_power(0.216), 1.0);
        assert_eq!(next.wh, 0.0);
        assert_eq!(next.kwh, 2.501);
    }

    #[test]
    fn test_negative_power_is_integrated_as_reported() {
        let prior = EnergyState::new(0.5, 1.0);
        let next = update(prior, &at_power(-360.0), 1.0);
        assert_eq!(next.wh, 0.4);
        assert_eq!(next.kwh, 1.0);
    }

    #[test]
    fn test_carry_includes_overshoot() {
        let prior = EnergyState::new(0.9, 0.0);
        // 0.9 + 1.0 = 1.9 Wh carried whole
        let next = update(prior, &at_power(3600.0), 1.0);
        assert_eq!(next.wh, 0.0);
        assert_eq!(next.kwh, 0.002);
    }

    proptest! {
        #[test]
        fn prop_kwh_never_decreases(powers in prop::collection::vec(0.0f64..5000.0, 1..400)) {
            let mut state = EnergyState::default();
            for p in powers {
                let next = state.accumulate(&at_power(p), 1.0);
                prop_assert!(next.kwh >= state.kwh);
                prop_assert!(next.wh >= 0.0);
                state = next;
            }
        }

        #[test]
        fn prop_carry_is_lossless(power in 1.0f64..3600.0, start_kwh in 0u32..100_000) {
            let mut state = EnergyState::new(0.0, start_kwh as f64 / 1000.0);
            loop {
                let wh_at_carry = round_to(state.wh + power / SECONDS_PER_HOUR, WH_DECIMALS);
                let next = state.accumulate(&at_power(power), 1.0);
                if wh_at_carry >= WH_CARRY_THRESHOLD {
                    prop_assert_eq!(next.wh, 0.0);
                    let gained = next.kwh - state.kwh;
                    prop_assert!((gained - wh_at_carry * KWH_PER_WH).abs() <= 0.0005 + 1e-9);
                    break;
                }
                prop_assert!(next.wh > state.wh);
                prop_assert_eq!(next.kwh, state.kwh);
                state = next;
            }
        }
    }
}
