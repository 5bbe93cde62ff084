//! Voltage/current calculation over raw ADC samples, EmonLib style.
//!
//! The voltage and current channels are sampled in pairs over a whole number
//! of half-waves. A slow low-pass filter tracks each channel's DC offset and
//! the voltage sample is interpolated toward the current sample's instant to
//! correct for the delay between the two reads.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::{PI, SQRT_2};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

use super::Meter;
use crate::config::{MeterConfig, SimulationConfig};
use crate::domain::MeasurementSample;

/// Source of paired raw ADC readings.
pub trait AdcSource: Send {
    fn read_voltage(&mut self) -> io::Result<u16>;
    fn read_current(&mut self) -> io::Result<u16>;
}

/// Per-channel calibration plus the converter geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub current: f64,
    pub voltage: f64,
    pub phase: f64,
    pub adc_bits: u32,
    pub supply_millivolts: u32,
}

impl Calibration {
    pub fn from_config(cfg: &MeterConfig) -> Self {
        Self {
            current: cfg.current_calibration,
            voltage: cfg.voltage_calibration,
            phase: cfg.phase_calibration,
            adc_bits: cfg.adc_bits,
            supply_millivolts: cfg.supply_millivolts,
        }
    }

    pub fn adc_counts(&self) -> f64 {
        (1u32 << self.adc_bits) as f64
    }

    /// Volts per ADC count on the voltage channel.
    pub fn voltage_ratio(&self) -> f64 {
        self.voltage * (self.supply_millivolts as f64 / 1000.0) / self.adc_counts()
    }

    /// Amps per ADC count on the current channel.
    pub fn current_ratio(&self) -> f64 {
        self.current * (self.supply_millivolts as f64 / 1000.0) / self.adc_counts()
    }
}

pub struct EmonCalculator<A: AdcSource> {
    adc: A,
    cal: Calibration,
    offset_v: f64,
    offset_i: f64,
}

impl<A: AdcSource> EmonCalculator<A> {
    pub fn new(adc: A, cal: Calibration) -> Self {
        let mid = cal.adc_counts() / 2.0;
        Self {
            adc,
            cal,
            offset_v: mid,
            offset_i: mid,
        }
    }

    /// Measure over `crossings` voltage zero-crossings or until `timeout`.
    ///
    /// A read error ends the window early; whatever was gathered is used.
    pub fn calc_vi(&mut self, crossings: u32, timeout: Duration) -> MeasurementSample {
        let counts = self.cal.adc_counts();

        // Start close to a zero-crossing so the window covers whole half-waves.
        let start = Instant::now();
        let mut start_v = counts / 2.0;
        loop {
            match self.adc.read_voltage() {
                Ok(v) => {
                    start_v = v as f64;
                    if start_v < counts * 0.55 && start_v > counts * 0.45 {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "voltage ADC read failed while waiting for crossing");
                    break;
                }
            }
            if start.elapsed() > timeout {
                break;
            }
        }

        let mut cross_count = 0u32;
        let mut n = 0u64;
        let (mut sum_v, mut sum_i, mut sum_p) = (0.0, 0.0, 0.0);
        let mut filtered_v = 0.0;
        let mut check_cross = false;

        let start = Instant::now();
        while cross_count < crossings && start.elapsed() < timeout {
            let (sample_v, sample_i) = match (self.adc.read_voltage(), self.adc.read_current()) {
                (Ok(v), Ok(i)) => (v as f64, i as f64),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, samples = n, "ADC read failed mid-window");
                    break;
                }
            };
            n += 1;

            let last_filtered_v = filtered_v;
            self.offset_v += (sample_v - self.offset_v) / counts;
            filtered_v = sample_v - self.offset_v;
            self.offset_i += (sample_i - self.offset_i) / counts;
            let filtered_i = sample_i - self.offset_i;

            sum_v += filtered_v * filtered_v;
            sum_i += filtered_i * filtered_i;

            let shifted_v = last_filtered_v + self.cal.phase * (filtered_v - last_filtered_v);
            sum_p += shifted_v * filtered_i;

            let last_cross = if n == 1 { sample_v > start_v } else { check_cross };
            check_cross = sample_v > start_v;
            if last_cross != check_cross {
                cross_count += 1;
            }
        }

        if n == 0 {
            return MeasurementSample::default();
        }

        let v_ratio = self.cal.voltage_ratio();
        let i_ratio = self.cal.current_ratio();
        let nf = n as f64;
        let vrms = v_ratio * (sum_v / nf).sqrt();
        let irms = i_ratio * (sum_i / nf).sqrt();
        let real_power = v_ratio * i_ratio * sum_p / nf;
        let apparent_power = vrms * irms;
        let power_factor = if apparent_power > 0.0 {
            real_power / apparent_power
        } else {
            0.0
        };
        trace!(samples = n, crossings = cross_count, "calc_vi window");

        MeasurementSample {
            irms,
            vrms,
            apparent_power,
            real_power,
            power_factor,
        }
    }
}

impl<A: AdcSource> Meter for EmonCalculator<A> {
    fn sample(&mut self, half_wavelengths: u32, timeout: Duration) -> MeasurementSample {
        self.calc_vi(half_wavelengths, timeout)
    }
}

/// Synthetic mains waveform rendered in ADC counts.
pub struct SimulatedAdc {
    mid: f64,
    max: f64,
    v_peak: f64,
    i_peak: f64,
    lag: f64,
    samples_per_cycle: f64,
    step: u64,
    noise: Option<Normal<f64>>,
    rng: StdRng,
}

impl SimulatedAdc {
    pub const SAMPLES_PER_CYCLE: f64 = 96.0;

    pub fn new(sim: &SimulationConfig, cal: &Calibration) -> Self {
        let counts = cal.adc_counts();
        let noise = (sim.noise_counts > 0.0)
            .then(|| Normal::new(0.0, sim.noise_counts).ok())
            .flatten();
        Self {
            mid: counts / 2.0,
            max: counts - 1.0,
            v_peak: sim.mains_voltage_rms / cal.voltage_ratio() * SQRT_2,
            i_peak: sim.load_current_rms / cal.current_ratio() * SQRT_2,
            lag: sim.phase_lag_degrees.to_radians(),
            samples_per_cycle: Self::SAMPLES_PER_CYCLE,
            step: 0,
            noise,
            rng: StdRng::from_entropy(),
        }
    }

    fn angle(&self) -> f64 {
        2.0 * PI * (self.step as f64) / self.samples_per_cycle
    }

    fn to_counts(&mut self, value: f64) -> u16 {
        let jitter = match self.noise {
            Some(n) => n.sample(&mut self.rng),
            None => 0.0,
        };
        (self.mid + value + jitter).round().clamp(0.0, self.max) as u16
    }
}

impl AdcSource for SimulatedAdc {
    fn read_voltage(&mut self) -> io::Result<u16> {
        self.step = self.step.wrapping_add(1);
        let v = self.v_peak * self.angle().sin();
        Ok(self.to_counts(v))
    }

    fn read_current(&mut self) -> io::Result<u16> {
        let i = self.i_peak * (self.angle() - self.lag).sin();
        Ok(self.to_counts(i))
    }
}

/// Linux Industrial I/O ADC read through sysfs `in_voltageN_raw` attributes.
pub struct IioAdc {
    voltage_path: PathBuf,
    current_path: PathBuf,
}

impl IioAdc {
    pub fn new(device_dir: &str, voltage_channel: u32, current_channel: u32) -> io::Result<Self> {
        let dir = PathBuf::from(device_dir);
        let voltage_path = dir.join(format!("in_voltage{voltage_channel}_raw"));
        let current_path = dir.join(format!("in_voltage{current_channel}_raw"));
        for p in [&voltage_path, &current_path] {
            if !p.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("IIO channel {} not found", p.display()),
                ));
            }
        }
        Ok(Self {
            voltage_path,
            current_path,
        })
    }

    fn read_raw(path: &Path) -> io::Result<u16> {
        let raw = fs::read_to_string(path)?;
        raw.trim()
            .parse::<u16>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl AdcSource for IioAdc {
    fn read_voltage(&mut self) -> io::Result<u16> {
        Self::read_raw(&self.voltage_path)
    }

    fn read_current(&mut self) -> io::Result<u16> {
        Self::read_raw(&self.current_path)
    }
}
