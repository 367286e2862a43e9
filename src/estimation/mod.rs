//! Estimation capabilities
//!
//! The gateway only talks to angle estimation, position solving and smoothing
//! through the traits in this module. [`ReferenceEstimators`] wires up the
//! built-in implementations; tests and alternative math backends provide their
//! own [`EstimatorFactory`].

pub mod filter;
pub mod interferometer;
pub mod multilateration;
#[cfg(test)]
pub(crate) mod testing;

use crate::domain::iq::ArrayType;
use crate::domain::models::{Coordinate, Orientation};
use crate::domain::settings::{AzimuthMask, InterferometerSettings};
use std::fmt;
use thiserror::Error;

pub use filter::ExponentialFilter;
pub use interferometer::PhaseInterferometer;
pub use multilateration::RayIntersection;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EstimatorError {
    #[error("estimation failed: {0}")]
    Failed(String),
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f32 },
    #[error("unknown locator handle {0}")]
    UnknownLocator(LocatorHandle),
    #[error("no result available yet")]
    NoResult,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Angles {
    pub azimuth: f32,
    pub elevation: f32,
}

/// Outcome of one angle estimation step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AngleEstimate {
    Ready(Angles),
    /// More packets are needed before an angle can be reported
    InProgress,
}

/// IQ sample quality bitmask reported by an angle estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityFlags(pub u32);

impl QualityFlags {
    pub const REF_ANT_PHASE_JITTER: u32 = 1 << 0;
    pub const ANT_X_PHASE_JITTER: u32 = 1 << 1;
    pub const SNDR: u32 = 1 << 2;
    pub const OTHER: u32 = 1 << 7;

    pub fn is_set(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// Human-readable IQ quality category, diagnostic only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqQuality {
    Good,
    PhaseJitter,
    LowReferenceSndr,
    Other,
}

impl From<QualityFlags> for IqQuality {
    fn from(flags: QualityFlags) -> Self {
        if flags.0 == 0 {
            Self::Good
        } else if flags.is_set(QualityFlags::REF_ANT_PHASE_JITTER)
            || flags.is_set(QualityFlags::ANT_X_PHASE_JITTER)
        {
            Self::PhaseJitter
        } else if flags.is_set(QualityFlags::SNDR) {
            Self::LowReferenceSndr
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for IqQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => f.write_str("Good"),
            Self::PhaseJitter => f.write_str("Caution - phase jitter too large"),
            Self::LowReferenceSndr => f.write_str("Caution - reference period SNDR too low"),
            Self::Other => f.write_str("Caution (other)"),
        }
    }
}

/// Turns IQ captures into azimuth and elevation
pub trait AngleEstimator {
    /// Phase advance per reference sample, in radians
    fn compute_phase_rotation(&mut self, ref_i: &[f32], ref_q: &[f32]) -> Result<f32, EstimatorError>;

    /// Grids are indexed `[snapshot][antenna]`
    fn estimate(
        &mut self,
        antenna_i: &[Vec<f32>],
        antenna_q: &[Vec<f32>],
        phase_rotation: f32,
        center_frequency_hz: f64,
    ) -> Result<AngleEstimate, EstimatorError>;

    fn quality(&self) -> QualityFlags;
}

/// Estimator-assigned key of a locator registered with a [`PositionEstimator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocatorHandle(pub usize);

impl fmt::Display for LocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Azimuth,
    Elevation,
    Distance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

/// Solves a 3-D position from per-locator angle (and optionally distance) measurements
pub trait PositionEstimator {
    fn register_locator(
        &mut self,
        coordinate: Coordinate,
        orientation: Orientation,
    ) -> Result<LocatorHandle, EstimatorError>;

    fn set_measurement(
        &mut self,
        locator: LocatorHandle,
        kind: MeasurementKind,
        value: f32,
    ) -> Result<(), EstimatorError>;

    /// Process the measurements set since the last clear
    fn step(&mut self, dt_seconds: f32) -> Result<(), EstimatorError>;

    fn result(&self, axis: Axis) -> Result<f32, EstimatorError>;

    fn clear_measurements(&mut self) -> Result<(), EstimatorError>;
}

/// Stateful scalar low-pass filter
pub trait SmoothingFilter {
    /// `amount` ranges from 0 (no filtering) to 1
    fn configure(&mut self, amount: f32) -> Result<(), EstimatorError>;

    fn apply(&mut self, raw: f32) -> f32;
}

/// Creates fresh capability instances for new locator sessions and tags
pub trait EstimatorFactory {
    fn angle_estimator(&self) -> Result<Box<dyn AngleEstimator>, EstimatorError>;
    fn position_estimator(&self) -> Result<Box<dyn PositionEstimator>, EstimatorError>;
    fn smoothing_filter(&self) -> Result<Box<dyn SmoothingFilter>, EstimatorError>;
}

/// Factory for the built-in estimators
#[derive(Debug, Clone)]
pub struct ReferenceEstimators {
    array_type: ArrayType,
    azimuth_mask: Option<AzimuthMask>,
    interferometer: InterferometerSettings,
}

impl ReferenceEstimators {
    pub fn new(
        array_type: ArrayType,
        azimuth_mask: Option<AzimuthMask>,
        interferometer: InterferometerSettings,
    ) -> Self {
        Self {
            array_type,
            azimuth_mask,
            interferometer,
        }
    }
}

impl EstimatorFactory for ReferenceEstimators {
    fn angle_estimator(&self) -> Result<Box<dyn AngleEstimator>, EstimatorError> {
        let estimator = PhaseInterferometer::new(
            self.array_type,
            self.interferometer.element_spacing_m,
            self.interferometer.packets_per_estimate,
        )?
        .with_azimuth_mask(self.azimuth_mask);
        Ok(Box::new(estimator))
    }

    fn position_estimator(&self) -> Result<Box<dyn PositionEstimator>, EstimatorError> {
        Ok(Box::new(RayIntersection::new()))
    }

    fn smoothing_filter(&self) -> Result<Box<dyn SmoothingFilter>, EstimatorError> {
        Ok(Box::new(ExponentialFilter::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_categories() {
        assert_eq!(IqQuality::from(QualityFlags(0)), IqQuality::Good);
        assert_eq!(
            IqQuality::from(QualityFlags(QualityFlags::ANT_X_PHASE_JITTER | QualityFlags::SNDR)),
            IqQuality::PhaseJitter
        );
        assert_eq!(
            IqQuality::from(QualityFlags(QualityFlags::SNDR)),
            IqQuality::LowReferenceSndr
        );
        assert_eq!(IqQuality::from(QualityFlags(QualityFlags::OTHER)), IqQuality::Other);
    }

    #[test]
    fn test_reference_factory_builds_each_capability() {
        let factory = ReferenceEstimators::new(
            ArrayType::Ura4x4,
            None,
            InterferometerSettings::default(),
        );
        assert!(factory.angle_estimator().is_ok());
        assert!(factory.position_estimator().is_ok());
        assert!(factory.smoothing_filter().is_ok());
    }
}
