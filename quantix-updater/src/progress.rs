//! Fractional progress with an explicit "unknown" value.

use std::fmt;

/// Changes smaller than this are not reported.
pub const PROGRESS_EPSILON: f64 = 0.001;

/// Progress in `[0, 1]`, or unknown (`NaN`).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Progress(f64);

impl Progress {
    pub const ZERO: Progress = Progress(0.0);
    pub const COMPLETE: Progress = Progress(1.0);
    pub const UNKNOWN: Progress = Progress(f64::NAN);

    /// Create a progress value, clamping into `[0, 1]`. `NaN` stays unknown.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            Self::UNKNOWN
        } else {
            Progress(value.clamp(0.0, 1.0))
        }
    }

    /// Progress of `done` out of `total`; unknown if `total` is unknown or zero.
    pub fn from_ratio(done: u64, total: Option<u64>) -> Self {
        match total {
            Some(total) if total > 0 => Self::new(done as f64 / total as f64),
            _ => Self::UNKNOWN,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_nan()
    }

    /// The fraction, or `None` if unknown.
    pub fn value(&self) -> Option<f64> {
        if self.is_unknown() {
            None
        } else {
            Some(self.0)
        }
    }

    /// The raw value, `NaN` if unknown.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Whether moving from `self` to `next` is worth reporting.
    ///
    /// Known and unknown always differ, two unknowns never do, and two known
    /// values must be at least [`PROGRESS_EPSILON`] apart.
    pub fn differs_from(&self, next: Progress) -> bool {
        match (self.value(), next.value()) {
            (None, None) => false,
            (Some(a), Some(b)) => (a - b).abs() >= PROGRESS_EPSILON,
            _ => true,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{:.1}%", v * 100.0),
            None => write!(f, "unknown"),
        }
    }
}
