use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidGains {
    /// Gains for output expressed as a fraction of full power.
    fn default() -> Self {
        Self {
            kp: 0.2,
            ki: 0.000_16,
            kd: 0.625,
        }
    }
}

impl PidGains {
    pub fn is_valid(&self) -> bool {
        [self.kp, self.ki, self.kd]
            .iter()
            .all(|gain| gain.is_finite() && *gain >= 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputBounds {
    pub min: f32,
    pub max: f32,
}

impl OutputBounds {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        if value > self.max {
            self.max
        } else if value < self.min {
            self.min
        } else {
            value
        }
    }
}

impl Default for OutputBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

/**
### Discrete PID with conditional integration
* Integral only grows while the output is not saturated in the direction of the error
* Integral is kept within `[min/ki, max/ki]`
* Derivative term is low-pass filtered, zero on the first step after reset
*/
#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    bounds: OutputBounds,
    derivative_alpha: f32,
    integral: f32,
    prev_error: Option<f32>,
    derivative: f32,
    output: f32,
}

impl PidController {
    pub fn new(gains: PidGains, bounds: OutputBounds, derivative_alpha: f32) -> Self {
        let derivative_alpha = if derivative_alpha.is_finite() && derivative_alpha > 0.0 {
            derivative_alpha.min(1.0)
        } else {
            1.0
        };
        Self {
            gains,
            bounds,
            derivative_alpha,
            integral: 0.0,
            prev_error: None,
            derivative: 0.0,
            output: 0.0,
        }
    }

    pub fn reset(&mut self, gains: PidGains, bounds: OutputBounds) {
        self.gains = gains;
        self.bounds = bounds;
        self.integral = 0.0;
        self.prev_error = None;
        self.derivative = 0.0;
        self.output = 0.0;
    }

    pub fn step(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        let error = setpoint - measurement;
        if !error.is_finite() || !dt.is_finite() || dt <= 0.0 {
            //next valid sample starts a fresh derivative
            self.prev_error = None;
            self.derivative = 0.0;
            self.output = self.bounds.clamp(0.0);
            return self.output;
        }

        let raw_derivative = match self.prev_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        self.prev_error = Some(error);
        self.derivative += self.derivative_alpha * (raw_derivative - self.derivative);

        let PidGains { kp, ki, kd } = self.gains;
        let p = kp * error;
        let d = kd * self.derivative;

        if ki > 0.0 {
            let candidate = self.integral + error * dt;
            let unclamped = p + ki * candidate + d;
            self.integral = if unclamped > self.bounds.max && error > 0.0 {
                //only integrate up to the point where the output saturates
                candidate.min(((self.bounds.max - p - d) / ki).max(self.integral))
            } else if unclamped < self.bounds.min && error < 0.0 {
                candidate.max(((self.bounds.min - p - d) / ki).min(self.integral))
            } else {
                candidate
            };
            let low = self.bounds.min / ki;
            let high = self.bounds.max / ki;
            self.integral = self.integral.max(low).min(high);
        }

        self.output = self.bounds.clamp(p + ki * self.integral + d);
        self.output
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn bounds(&self) -> OutputBounds {
        self.bounds
    }
}
