//! Scriptable capability stubs shared by unit tests

use super::*;
use std::cell::RefCell;
use std::rc::Rc;

/// Knobs the stubs read on every call
#[derive(Debug, Clone)]
pub struct StubControl {
    /// Number of upcoming angle estimates that report InProgress
    pub in_progress: u32,
    pub fail_angle: bool,
    pub angles: Angles,
    pub quality: u32,
    pub fail_step: bool,
    pub fail_register: bool,
    pub position: [f32; 3],
}

impl Default for StubControl {
    fn default() -> Self {
        Self {
            in_progress: 0,
            fail_angle: false,
            angles: Angles {
                azimuth: 10.0,
                elevation: 20.0,
            },
            quality: 0,
            fail_step: false,
            fail_register: false,
            position: [1.0, 2.0, 3.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionCall {
    Register(Coordinate),
    Set(LocatorHandle, MeasurementKind, f32),
    Step(f32),
    Clear,
}

#[derive(Debug, Default)]
pub struct StubLog {
    pub position_calls: Vec<PositionCall>,
    pub angle_estimators: usize,
    pub position_estimators: usize,
    pub filters: usize,
    pub filter_amounts: Vec<f32>,
}

#[derive(Clone, Default)]
pub struct StubFactory {
    pub control: Rc<RefCell<StubControl>>,
    pub log: Rc<RefCell<StubLog>>,
}

impl StubFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_calls(&self) -> Vec<PositionCall> {
        self.log.borrow().position_calls.clone()
    }

    pub fn distance_calls(&self) -> usize {
        self.log
            .borrow()
            .position_calls
            .iter()
            .filter(|c| matches!(c, PositionCall::Set(_, MeasurementKind::Distance, _)))
            .count()
    }

    pub fn step_calls(&self) -> usize {
        self.log
            .borrow()
            .position_calls
            .iter()
            .filter(|c| matches!(c, PositionCall::Step(_)))
            .count()
    }
}

struct StubAngle {
    control: Rc<RefCell<StubControl>>,
}

impl AngleEstimator for StubAngle {
    fn compute_phase_rotation(&mut self, _ref_i: &[f32], _ref_q: &[f32]) -> Result<f32, EstimatorError> {
        Ok(0.0)
    }

    fn estimate(
        &mut self,
        _antenna_i: &[Vec<f32>],
        _antenna_q: &[Vec<f32>],
        _phase_rotation: f32,
        _center_frequency_hz: f64,
    ) -> Result<AngleEstimate, EstimatorError> {
        let mut control = self.control.borrow_mut();
        if control.fail_angle {
            return Err(EstimatorError::Failed("scripted".to_string()));
        }
        if control.in_progress > 0 {
            control.in_progress -= 1;
            return Ok(AngleEstimate::InProgress);
        }
        Ok(AngleEstimate::Ready(control.angles))
    }

    fn quality(&self) -> QualityFlags {
        QualityFlags(self.control.borrow().quality)
    }
}

struct StubPosition {
    control: Rc<RefCell<StubControl>>,
    log: Rc<RefCell<StubLog>>,
    registered: usize,
}

impl PositionEstimator for StubPosition {
    fn register_locator(
        &mut self,
        coordinate: Coordinate,
        _orientation: Orientation,
    ) -> Result<LocatorHandle, EstimatorError> {
        if self.control.borrow().fail_register {
            return Err(EstimatorError::Failed("scripted".to_string()));
        }
        self.log
            .borrow_mut()
            .position_calls
            .push(PositionCall::Register(coordinate));
        self.registered += 1;
        // Offset handles so tests notice callers that confuse them with slots
        Ok(LocatorHandle(100 + self.registered - 1))
    }

    fn set_measurement(
        &mut self,
        locator: LocatorHandle,
        kind: MeasurementKind,
        value: f32,
    ) -> Result<(), EstimatorError> {
        self.log
            .borrow_mut()
            .position_calls
            .push(PositionCall::Set(locator, kind, value));
        Ok(())
    }

    fn step(&mut self, dt_seconds: f32) -> Result<(), EstimatorError> {
        self.log
            .borrow_mut()
            .position_calls
            .push(PositionCall::Step(dt_seconds));
        if self.control.borrow().fail_step {
            return Err(EstimatorError::Failed("scripted".to_string()));
        }
        Ok(())
    }

    fn result(&self, axis: Axis) -> Result<f32, EstimatorError> {
        let position = self.control.borrow().position;
        Ok(match axis {
            Axis::X => position[0],
            Axis::Y => position[1],
            Axis::Z => position[2],
        })
    }

    fn clear_measurements(&mut self) -> Result<(), EstimatorError> {
        self.log.borrow_mut().position_calls.push(PositionCall::Clear);
        Ok(())
    }
}

/// Pass-through filter
struct StubFilter;

impl SmoothingFilter for StubFilter {
    fn configure(&mut self, _amount: f32) -> Result<(), EstimatorError> {
        Ok(())
    }

    fn apply(&mut self, raw: f32) -> f32 {
        raw
    }
}

struct LoggingFilter {
    inner: StubFilter,
    log: Rc<RefCell<StubLog>>,
}

impl SmoothingFilter for LoggingFilter {
    fn configure(&mut self, amount: f32) -> Result<(), EstimatorError> {
        self.log.borrow_mut().filter_amounts.push(amount);
        self.inner.configure(amount)
    }

    fn apply(&mut self, raw: f32) -> f32 {
        self.inner.apply(raw)
    }
}

impl EstimatorFactory for StubFactory {
    fn angle_estimator(&self) -> Result<Box<dyn AngleEstimator>, EstimatorError> {
        self.log.borrow_mut().angle_estimators += 1;
        Ok(Box::new(StubAngle {
            control: self.control.clone(),
        }))
    }

    fn position_estimator(&self) -> Result<Box<dyn PositionEstimator>, EstimatorError> {
        self.log.borrow_mut().position_estimators += 1;
        Ok(Box::new(StubPosition {
            control: self.control.clone(),
            log: self.log.clone(),
            registered: 0,
        }))
    }

    fn smoothing_filter(&self) -> Result<Box<dyn SmoothingFilter>, EstimatorError> {
        self.log.borrow_mut().filters += 1;
        Ok(Box::new(LoggingFilter {
            inner: StubFilter,
            log: self.log.clone(),
        }))
    }
}
