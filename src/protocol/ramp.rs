/// True while the path keeps up: observed rho is within `alpha` of the rate.
pub fn keeps_up(rho: i64, rate_kbps: u64, alpha: f64) -> bool {
    if rate_kbps == 0 {
        return false;
    }
    (rho as f64 / rate_kbps as f64 - 1.0).abs() < alpha
}

/// Linear ramp of a participant: step up while the path keeps up, freeze on
/// the first divergence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    rate_kbps: u64,
    step_kbps: u64,
    alpha: f64,
    stopped: bool,
}

impl Ramp {
    pub fn new(rate_kbps: u64, step_kbps: u64, alpha: f64) -> Self {
        Ramp {
            rate_kbps,
            step_kbps,
            alpha,
            stopped: false,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate_kbps
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Feeds the rho observed at the current rate.
    pub fn observe(&mut self, rho: i64) {
        if !self.stopped && keeps_up(rho, self.rate_kbps, self.alpha) {
            self.rate_kbps += self.step_kbps;
        } else {
            self.stopped = true;
        }
    }
}

/// Fixed-rate reference of a pairwise round. The rate only grows, by a margin,
/// while the reference itself falls short of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRate {
    target_kbps: u64,
    margin_kbps: u64,
    step_kbps: u64,
    satisfied: bool,
}

impl ReferenceRate {
    pub fn new(target_kbps: u64, step_kbps: u64) -> Self {
        ReferenceRate {
            target_kbps,
            margin_kbps: 0,
            step_kbps,
            satisfied: false,
        }
    }

    pub fn rate(&self) -> u64 {
        self.target_kbps + self.margin_kbps
    }

    pub fn satisfied(&self) -> bool {
        self.satisfied
    }

    pub fn observe(&mut self, rho: i64) {
        if rho < self.target_kbps as i64 {
            self.margin_kbps += self.step_kbps;
        } else {
            self.satisfied = true;
        }
    }
}
