//! Exponential smoothing filter

use super::{EstimatorError, SmoothingFilter};

/// First-order low-pass filter: `out = amount * previous + (1 - amount) * raw`
///
/// The first sample passes through unchanged.
#[derive(Debug, Clone)]
pub struct ExponentialFilter {
    amount: f32,
    state: Option<f32>,
}

impl ExponentialFilter {
    pub fn new() -> Self {
        Self {
            amount: 0.0,
            state: None,
        }
    }
}

impl Default for ExponentialFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SmoothingFilter for ExponentialFilter {
    fn configure(&mut self, amount: f32) -> Result<(), EstimatorError> {
        if !(0.0..=1.0).contains(&amount) {
            return Err(EstimatorError::InvalidParameter {
                name: "amount_of_filtering",
                value: amount,
            });
        }
        self.amount = amount;
        Ok(())
    }

    fn apply(&mut self, raw: f32) -> f32 {
        if !raw.is_finite() {
            // Keep the last good output instead of poisoning the state
            return self.state.unwrap_or(raw);
        }
        let out = match self.state {
            Some(previous) => self.amount * previous + (1.0 - self.amount) * raw,
            None => raw,
        };
        self.state = Some(out);
        out
    }
}
