//! Sensor sampling and conditioning.
//!
//! Raw inputs flow through validate → median → moving average per channel:
//!
//! ```text
//! ADC ──▶ engineering units ──▶ valid? ──▶ median ──▶ moving avg ──▶ reading
//!                                 │ no
//!                                 └──▶ failure counter (fault at 10)
//! ```
//!
//! An invalid sample never reaches the filters — the previous conditioned
//! value is kept — and a single bad sample never reports a fault; only a
//! run of consecutive failures does. Channels that do not exist on the
//! machine variant are `None` in every reading.

pub mod filter;
pub mod ntc;

use log::{info, warn};

use crate::machine::MachineKind;
use filter::{MedianFilter, MovingAvgFilter};

/// Consecutive invalid samples before a channel reports a fault.
pub const SENSOR_FAULT_THRESHOLD: u16 = 10;

/// Raw inputs the hub samples each tick. Implemented by the ADC/GPIO layer
/// on hardware and by the scenario scripts in tests and the simulator.
pub trait SensorInputs {
    /// Brew boiler NTC raw ADC count.
    fn brew_adc(&mut self) -> u16;
    /// Steam boiler NTC raw ADC count.
    fn steam_adc(&mut self) -> u16;
    /// Pressure channel voltage at the ADC pin.
    fn pressure_volts(&mut self) -> f32;
    /// Water-level probe states.
    fn water_probes(&mut self) -> WaterProbes;
}

/// Digital water-probe snapshot. `None` = probe not fitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaterProbes {
    /// True when the machine is plumbed in (no tank to run dry).
    pub plumbed: bool,
    /// Magnetic float in the tank: true = water ok.
    pub tank_ok: Option<bool>,
    /// Steam boiler probe: true = water present.
    pub steam_ok: Option<bool>,
}

/// A validated, filtered sensor snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReading {
    pub brew_temp_c: Option<f32>,
    pub steam_temp_c: Option<f32>,
    pub group_temp_c: Option<f32>,
    pub pressure_bar: Option<f32>,
    /// 0 = tank empty, 50 = steam boiler low, 100 = ok.
    pub water_level_pct: u8,
    /// False until the first valid sample has been conditioned.
    pub valid: bool,
}

/// One filtered temperature channel.
struct TempChannel {
    median: MedianFilter<5>,
    avg: MovingAvgFilter<8>,
    value: Option<f32>,
    failures: u16,
    fault: bool,
    label: &'static str,
}

impl TempChannel {
    fn new(label: &'static str) -> Self {
        Self {
            median: MedianFilter::new(),
            avg: MovingAvgFilter::new(),
            value: None,
            failures: 0,
            fault: false,
            label,
        }
    }

    fn push(&mut self, adc: u16) {
        match ntc::adc_to_temp(adc).filter(|t| ntc::validate_temp(*t)) {
            Some(temp) => {
                if self.failures > 0 {
                    info!("Sensors: {} recovered after {} failures", self.label, self.failures);
                }
                self.failures = 0;
                self.fault = false;
                let median = self.median.update(temp);
                self.value = Some(self.avg.update(median));
            }
            None => {
                self.failures = self.failures.saturating_add(1);
                if self.failures == SENSOR_FAULT_THRESHOLD {
                    warn!(
                        "Sensors: {} invalid (ADC={}) for {} consecutive samples",
                        self.label, adc, self.failures
                    );
                    self.fault = true;
                }
                // Keep the previous conditioned value.
            }
        }
    }
}

/// Aggregates every sensor on the controller.
pub struct SensorHub {
    machine: MachineKind,
    brew: TempChannel,
    steam: TempChannel,
    pressure_median: MedianFilter<3>,
    pressure_avg: MovingAvgFilter<4>,
    pressure_value: Option<f32>,
    pressure_failures: u16,
    pressure_fault: bool,
    water_level_pct: u8,
    sampled_once: bool,
}

impl SensorHub {
    pub fn new(machine: MachineKind) -> Self {
        info!(
            "Sensors: init (brew_ntc: {}, steam_ntc: {})",
            machine.has_brew_ntc(),
            machine.has_steam_ntc()
        );
        Self {
            machine,
            brew: TempChannel::new("brew NTC"),
            steam: TempChannel::new("steam NTC"),
            pressure_median: MedianFilter::new(),
            pressure_avg: MovingAvgFilter::new(),
            pressure_value: None,
            pressure_failures: 0,
            pressure_fault: false,
            water_level_pct: 100,
            sampled_once: false,
        }
    }

    /// Sample every fitted sensor once and run the filter pipeline.
    pub fn sample(&mut self, inputs: &mut impl SensorInputs) {
        if self.machine.has_brew_ntc() {
            let adc = inputs.brew_adc();
            self.brew.push(adc);
        }
        if self.machine.has_steam_ntc() {
            let adc = inputs.steam_adc();
            self.steam.push(adc);
        }

        let volts = inputs.pressure_volts();
        match ntc::voltage_to_pressure(volts) {
            Some(bar) => {
                self.pressure_failures = 0;
                self.pressure_fault = false;
                let median = self.pressure_median.update(bar);
                self.pressure_value = Some(self.pressure_avg.update(median));
            }
            None => {
                self.pressure_failures = self.pressure_failures.saturating_add(1);
                if self.pressure_failures == SENSOR_FAULT_THRESHOLD {
                    warn!(
                        "Sensors: pressure voltage out of range ({volts:.2}V) for {} consecutive samples",
                        self.pressure_failures
                    );
                    self.pressure_fault = true;
                }
            }
        }

        self.water_level_pct = Self::water_level(inputs.water_probes());
        self.sampled_once = true;
    }

    /// Water level from the probe states.
    ///
    /// Plumbed machines only track the steam boiler probe; tank machines
    /// report 0 on an empty tank (critical) before the steam probe.
    fn water_level(probes: WaterProbes) -> u8 {
        if probes.plumbed {
            return match probes.steam_ok {
                Some(false) => 50,
                _ => 100,
            };
        }
        if probes.tank_ok == Some(false) {
            return 0;
        }
        if probes.steam_ok == Some(false) {
            return 50;
        }
        100
    }

    /// Latest conditioned snapshot.
    pub fn reading(&self) -> SensorReading {
        SensorReading {
            brew_temp_c: self.brew.value.filter(|_| self.machine.has_brew_ntc()),
            steam_temp_c: self.steam.value.filter(|_| self.machine.has_steam_ntc()),
            // Group head thermocouple support was removed; boiler NTCs are
            // sufficient for temperature control.
            group_temp_c: None,
            pressure_bar: self.pressure_value,
            water_level_pct: self.water_level_pct,
            valid: self.sampled_once,
        }
    }

    pub fn brew_fault(&self) -> bool {
        self.machine.has_brew_ntc() && self.brew.fault
    }

    pub fn steam_fault(&self) -> bool {
        self.machine.has_steam_ntc() && self.steam.fault
    }

    pub fn pressure_fault(&self) -> bool {
        self.pressure_fault
    }
}
