//! PID controller for boiler temperature.
//!
//! Derivative is taken **on measurement**, never on error, so a setpoint
//! step does not kick the output; the raw derivative passes through a
//! first-order low-pass before contributing. The integral accumulator is
//! clamped so its contribution alone can never exceed the output limit.

/// Output ceiling (heater duty is a percentage).
const OUTPUT_MAX: f32 = 100.0;
const OUTPUT_MIN: f32 = 0.0;

/// Derivative low-pass time constant (seconds).
const DERIVATIVE_FILTER_TAU: f32 = 0.5;

/// Below this, the integral term is skipped entirely rather than risking
/// a near-infinite accumulator clamp.
const KI_EPSILON: f32 = 0.001;

/// PID controller for one boiler.
pub struct PidController {
    kp: f32,
    ki: f32,
    kd: f32,
    setpoint: f32,
    /// Ramp target; `setpoint` slews toward it at `ramp_rate` per second.
    setpoint_target: f32,
    ramp_rate_c_per_s: f32,
    integral: f32,
    last_measurement: f32,
    last_derivative: f32,
    output: f32,
    first_run: bool,
}

impl PidController {
    pub fn new(kp: f32, ki: f32, kd: f32, setpoint: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint,
            setpoint_target: setpoint,
            ramp_rate_c_per_s: 1.0,
            integral: 0.0,
            last_measurement: 0.0,
            last_derivative: 0.0,
            output: 0.0,
            first_run: true,
        }
    }

    /// Jump the setpoint immediately (initialisation, mode change).
    pub fn set_setpoint(&mut self, setpoint: f32) {
        self.setpoint = setpoint;
        self.setpoint_target = setpoint;
    }

    /// Slew the setpoint toward `target` at the configured ramp rate.
    pub fn set_target(&mut self, target: f32) {
        self.setpoint_target = target;
    }

    pub fn set_ramp_rate(&mut self, c_per_s: f32) {
        if c_per_s > 0.0 {
            self.ramp_rate_c_per_s = c_per_s;
        }
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    /// Compute the duty cycle for the current measurement.
    ///
    /// Degenerate inputs (`dt <= 0`, NaN measurement) return 0 and leave
    /// all state unchanged.
    pub fn compute(&mut self, measurement: f32, dt: f32) -> f32 {
        if !(dt > 0.0) || measurement.is_nan() {
            return 0.0;
        }

        // Setpoint ramp toward the target.
        if self.setpoint != self.setpoint_target {
            let step = self.ramp_rate_c_per_s * dt;
            if (self.setpoint_target - self.setpoint).abs() <= step {
                self.setpoint = self.setpoint_target;
            } else if self.setpoint_target > self.setpoint {
                self.setpoint += step;
            } else {
                self.setpoint -= step;
            }
        }

        let error = self.setpoint - measurement;

        let p_term = self.kp * error;

        // Integral with anti-windup: the accumulator is clamped so
        // |integral * ki| <= OUTPUT_MAX, symmetrically for negative error.
        let mut i_term = 0.0;
        if self.ki > KI_EPSILON {
            self.integral += error * dt;
            let max_integral = OUTPUT_MAX / self.ki;
            self.integral = self.integral.clamp(-max_integral, max_integral);
            i_term = self.ki * self.integral;
        }

        // Derivative on measurement. First call establishes the baseline
        // and contributes nothing, so startup cannot spike the output.
        let mut d_term = 0.0;
        if self.first_run {
            self.last_measurement = measurement;
            self.last_derivative = 0.0;
            self.first_run = false;
        } else {
            let raw = (measurement - self.last_measurement) / dt;
            let alpha = dt / (DERIVATIVE_FILTER_TAU + dt);
            self.last_derivative = alpha * raw + (1.0 - alpha) * self.last_derivative;
            // Negative: a rising measurement must reduce output.
            d_term = -self.kd * self.last_derivative;
            self.last_measurement = measurement;
        }

        self.output = (p_term + i_term + d_term).clamp(OUTPUT_MIN, OUTPUT_MAX);
        self.output
    }

    /// Reset controller state (integral, derivative history, first-run).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_measurement = 0.0;
        self.last_derivative = 0.0;
        self.output = 0.0;
        self.first_run = true;
    }
}
