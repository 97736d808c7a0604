//! ADC-to-engineering-unit conversions.
//!
//! NTC thermistors sit in a voltage divider against a fixed series
//! resistor; the simplified Beta (Steinhart-Hart) equation converts the
//! measured resistance to a temperature. The pressure transducer is
//! ratiometric 0.5-4.5 V for 0-16 bar behind its own divider.

/// NTC 3.3 kOhm @ 25 C, B = 3950, per the boiler sensor datasheet.
pub const NTC_R25_OHMS: f32 = 3300.0;
pub const NTC_B_VALUE: f32 = 3950.0;
pub const NTC_SERIES_R_OHMS: f32 = 3300.0;
const T25_KELVIN: f32 = 298.15;

pub const ADC_MAX: f32 = 4095.0;
pub const ADC_VREF: f32 = 3.3;

/// Valid boiler temperature window; anything outside is a sensor fault.
pub const TEMP_VALID_RANGE_C: core::ops::RangeInclusive<f32> = -10.0..=200.0;

/// Divider-level sanity window for the pressure channel (volts at the ADC
/// pin). Outside this the transducer is disconnected or shorted.
pub const PRESSURE_ADC_SANITY_V: core::ops::RangeInclusive<f32> = 0.2..=3.0;

/// Pressure divider ratio: R_low / (R_low + R_series) = 10k / 15.6k.
const PRESSURE_DIVIDER_RATIO: f32 = 0.641;

/// Full pressure span: 0.5 V = 0 bar, 4.5 V = 16 bar.
pub const PRESSURE_MAX_BAR: f32 = 16.0;

/// Convert a raw ADC count to the voltage at the pin.
pub fn adc_to_voltage(adc_value: u16) -> f32 {
    (adc_value as f32 / ADC_MAX) * ADC_VREF
}

/// Convert an ADC reading to NTC resistance, or `None` when the reading is
/// pinned at a rail (open or shorted sensor).
pub fn adc_to_resistance(adc_value: u16, r_series: f32) -> Option<f32> {
    let voltage = adc_to_voltage(adc_value);
    if voltage <= 0.01 || voltage >= ADC_VREF - 0.01 {
        return None;
    }
    Some(r_series * voltage / (ADC_VREF - voltage))
}

/// Beta-equation inverse: resistance to Celsius.
pub fn resistance_to_temp(r_ntc: f32, r25: f32, beta: f32) -> Option<f32> {
    if r_ntc <= 0.0 {
        return None;
    }
    let inv_t = (1.0 / T25_KELVIN) + (1.0 / beta) * (r_ntc / r25).ln();
    if inv_t <= 0.0 {
        return None;
    }
    Some(1.0 / inv_t - 273.15)
}

/// ADC reading straight to Celsius for a boiler NTC.
pub fn adc_to_temp(adc_value: u16) -> Option<f32> {
    let r = adc_to_resistance(adc_value, NTC_SERIES_R_OHMS)?;
    resistance_to_temp(r, NTC_R25_OHMS, NTC_B_VALUE)
}

/// Range-validate a temperature reading.
pub fn validate_temp(temp_c: f32) -> bool {
    !temp_c.is_nan() && TEMP_VALID_RANGE_C.contains(&temp_c)
}

/// Convert the pressure-channel ADC voltage to bar.
///
/// Returns `None` when the pin voltage fails the sanity window (fault),
/// otherwise the pressure clamped into `[0, 16]` bar.
pub fn voltage_to_pressure(adc_voltage: f32) -> Option<f32> {
    if !PRESSURE_ADC_SANITY_V.contains(&adc_voltage) {
        return None;
    }
    let v_transducer = adc_voltage / PRESSURE_DIVIDER_RATIO;
    let bar = (v_transducer - 0.5) * PRESSURE_MAX_BAR / 4.0;
    Some(bar.clamp(0.0, PRESSURE_MAX_BAR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midscale_adc_reads_25c() {
        // Equal divider resistances: NTC at its R25, so 25 C.
        let temp = adc_to_temp(2048).unwrap();
        assert!((temp - 25.0).abs() < 0.5, "got {temp}");
    }

    #[test]
    fn hot_ntc_reads_above_90c() {
        // NTC resistance falls when hot: pin voltage drops well below mid.
        let temp = adc_to_temp(300).unwrap();
        assert!(temp > 90.0, "got {temp}");
    }

    #[test]
    fn rail_pinned_adc_is_fault() {
        assert!(adc_to_temp(0).is_none());
        assert!(adc_to_temp(4095).is_none());
    }

    #[test]
    fn temp_validation_window() {
        assert!(validate_temp(93.0));
        assert!(validate_temp(-10.0));
        assert!(validate_temp(200.0));
        assert!(!validate_temp(-11.0));
        assert!(!validate_temp(201.0));
        assert!(!validate_temp(f32::NAN));
    }

    #[test]
    fn pressure_zero_at_half_volt() {
        // 0.5 V at the transducer = 0.3205 V at the pin.
        let bar = voltage_to_pressure(0.5 * 0.641).unwrap();
        assert!(bar.abs() < 0.05, "got {bar}");
    }

    #[test]
    fn pressure_nine_bar() {
        // 9 bar -> transducer 0.5 + 9/4 = 2.75 V -> pin 1.763 V.
        let bar = voltage_to_pressure(2.75 * 0.641).unwrap();
        assert!((bar - 9.0).abs() < 0.1, "got {bar}");
    }

    #[test]
    fn pressure_sanity_window_rejects() {
        assert!(voltage_to_pressure(0.1).is_none());
        assert!(voltage_to_pressure(3.1).is_none());
    }

    #[test]
    fn pressure_clamped_to_span() {
        let bar = voltage_to_pressure(3.0).unwrap();
        assert!(bar <= PRESSURE_MAX_BAR);
    }
}
