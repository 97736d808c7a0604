//! Safety supervisor.
//!
//! Runs **every tick before the control layer** and accumulates a fault
//! bitmask. Any active fault gates the heater and pump outputs to zero;
//! the machine leaves its fault state only when *every* fault has cleared.
//!
//! ## Fault lifecycle
//!
//! 1. A condition triggers a fault (e.g. brew NTC invalid for 10 samples).
//! 2. The supervisor sets the corresponding bit.
//! 3. The control loop sees a non-zero mask and forces all duties to 0.
//! 4. Each tick the supervisor re-evaluates; a cleared condition unsets
//!    its bit.
//!
//! The bootloader handoff calls [`SafetySupervisor::enter_safe_state`] to
//! latch everything off before the update starts.

use log::{error, info};

use crate::error::SafetyFault;
use crate::sensors::{SensorHub, SensorReading};

/// Safety supervisor for the boiler/pump interlocks.
pub struct SafetySupervisor {
    max_boiler_temp_c: f32,
    /// Latched fault bitmask.
    faults: u8,
    /// Latched by the bootloader handoff; only a reset clears it.
    safe_state: bool,
}

impl SafetySupervisor {
    pub fn new(max_boiler_temp_c: f32) -> Self {
        Self {
            max_boiler_temp_c,
            faults: 0,
            safe_state: false,
        }
    }

    /// Evaluate all interlocks against the latest reading.
    /// Returns the updated fault bitmask.
    pub fn evaluate(&mut self, hub: &SensorHub, reading: &SensorReading) -> u8 {
        self.eval_fault(SafetyFault::BrewSensorFault, hub.brew_fault());
        self.eval_fault(SafetyFault::SteamSensorFault, hub.steam_fault());
        self.eval_fault(SafetyFault::PressureSensorFault, hub.pressure_fault());

        self.eval_fault(SafetyFault::WaterLow, reading.water_level_pct == 0);

        let over_temp = [reading.brew_temp_c, reading.steam_temp_c]
            .iter()
            .flatten()
            .any(|t| *t > self.max_boiler_temp_c);
        self.eval_fault(SafetyFault::OverTemperature, over_temp);

        self.faults
    }

    /// Current fault bitmask.
    pub fn faults(&self) -> u8 {
        self.faults
    }

    /// True if **any** fault is active or the safe state is latched.
    pub fn outputs_inhibited(&self) -> bool {
        self.faults != 0 || self.safe_state
    }

    pub fn has_fault(&self, fault: SafetyFault) -> bool {
        self.faults & fault.mask() != 0
    }

    /// Latch the safe state: all actuators off until reset. Used before
    /// the bootloader takes ownership of the link.
    pub fn enter_safe_state(&mut self) {
        if !self.safe_state {
            info!("Safety: entering safe state (heaters OFF)");
        }
        self.safe_state = true;
    }

    pub fn in_safe_state(&self) -> bool {
        self.safe_state
    }

    // ── Internal ──────────────────────────────────────────────────

    fn eval_fault(&mut self, fault: SafetyFault, condition: bool) {
        if condition {
            if self.faults & fault.mask() == 0 {
                error!("SAFETY FAULT SET: {fault}");
            }
            self.faults |= fault.mask();
        } else {
            if self.faults & fault.mask() != 0 {
                info!("SAFETY FAULT CLEARED: {fault}");
            }
            self.faults &= !fault.mask();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineKind;
    use crate::sensors::{SensorInputs, WaterProbes};

    struct Inputs {
        brew: u16,
        water: WaterProbes,
    }

    impl SensorInputs for Inputs {
        fn brew_adc(&mut self) -> u16 {
            self.brew
        }
        fn steam_adc(&mut self) -> u16 {
            2048
        }
        fn pressure_volts(&mut self) -> f32 {
            0.5
        }
        fn water_probes(&mut self) -> WaterProbes {
            self.water
        }
    }

    fn nominal_inputs() -> Inputs {
        Inputs {
            brew: 2048,
            water: WaterProbes {
                plumbed: false,
                tank_ok: Some(true),
                steam_ok: Some(true),
            },
        }
    }

    #[test]
    fn no_faults_initially() {
        let s = SafetySupervisor::new(165.0);
        assert_eq!(s.faults(), 0);
        assert!(!s.outputs_inhibited());
    }

    #[test]
    fn water_low_sets_and_clears() {
        let mut s = SafetySupervisor::new(165.0);
        let mut hub = SensorHub::new(MachineKind::DualBoiler);
        let mut inputs = nominal_inputs();
        inputs.water.tank_ok = Some(false);
        hub.sample(&mut inputs);
        s.evaluate(&hub, &hub.reading());
        assert!(s.has_fault(SafetyFault::WaterLow));

        inputs.water.tank_ok = Some(true);
        hub.sample(&mut inputs);
        s.evaluate(&hub, &hub.reading());
        assert!(!s.has_fault(SafetyFault::WaterLow));
    }

    #[test]
    fn over_temperature_from_reading() {
        let mut s = SafetySupervisor::new(80.0);
        let hub = SensorHub::new(MachineKind::DualBoiler);
        let reading = SensorReading {
            brew_temp_c: Some(95.0),
            ..Default::default()
        };
        s.evaluate(&hub, &reading);
        assert!(s.has_fault(SafetyFault::OverTemperature));
    }

    #[test]
    fn sensor_fault_propagates_from_hub() {
        let mut s = SafetySupervisor::new(165.0);
        let mut hub = SensorHub::new(MachineKind::DualBoiler);
        let mut inputs = nominal_inputs();
        inputs.brew = 0; // rail-pinned
        for _ in 0..crate::sensors::SENSOR_FAULT_THRESHOLD {
            hub.sample(&mut inputs);
        }
        s.evaluate(&hub, &hub.reading());
        assert!(s.has_fault(SafetyFault::BrewSensorFault));
        assert!(s.outputs_inhibited());
    }

    #[test]
    fn safe_state_latches() {
        let mut s = SafetySupervisor::new(165.0);
        s.enter_safe_state();
        assert!(s.outputs_inhibited());
        // Clearing faults does not clear the latch.
        let hub = SensorHub::new(MachineKind::DualBoiler);
        s.evaluate(&hub, &SensorReading::default());
        assert!(s.outputs_inhibited());
    }

    #[test]
    fn absent_channel_cannot_over_temp() {
        let mut s = SafetySupervisor::new(80.0);
        let hub = SensorHub::new(MachineKind::HeatExchanger);
        let reading = SensorReading {
            brew_temp_c: None,
            steam_temp_c: Some(75.0),
            ..Default::default()
        };
        s.evaluate(&hub, &reading);
        assert!(!s.has_fault(SafetyFault::OverTemperature));
    }
}
