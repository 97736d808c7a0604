//! Daily energy tracking.
//!
//! Meters report a lifetime cumulative import counter; the UI wants
//! "today". The first valid reading after calendar time is available
//! (NTP synced) captures the day-start value, and local midnight —
//! detected as a day-of-year or year change — moves it forward.

use chrono::{Datelike, NaiveDateTime};
use log::info;

use super::PowerMeterReading;

/// Midnight-anchored energy counter.
#[derive(Debug, Default)]
pub struct DailyEnergy {
    day_start_kwh: f32,
    day_start_set: bool,
    last_day_of_year: u32,
    last_year: i32,
}

impl DailyEnergy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest reading and local calendar time.
    pub fn update(&mut self, reading: &PowerMeterReading, local: NaiveDateTime) {
        let day_of_year = local.date().ordinal();
        let year = local.date().year();

        if !self.day_start_set && reading.valid {
            self.day_start_kwh = reading.energy_import;
            self.day_start_set = true;
            self.last_day_of_year = day_of_year;
            self.last_year = year;
            info!("Daily energy: day start initialised at {:.3} kWh", self.day_start_kwh);
            return;
        }

        if self.day_start_set && (day_of_year != self.last_day_of_year || year != self.last_year) {
            self.day_start_kwh = if reading.valid {
                reading.energy_import
            } else {
                0.0
            };
            self.last_day_of_year = day_of_year;
            self.last_year = year;
            info!("Daily energy: midnight reset, day start = {:.3} kWh", self.day_start_kwh);
        }
    }

    /// Energy consumed since local midnight. A negative delta means the
    /// meter was reset; its current counter then *is* today's total.
    pub fn today_kwh(&self, reading: &PowerMeterReading) -> f32 {
        if !reading.valid || !self.day_start_set {
            return 0.0;
        }
        let today = reading.energy_import - self.day_start_kwh;
        if today < 0.0 {
            reading.energy_import
        } else {
            today
        }
    }
}
