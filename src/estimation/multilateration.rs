//! Least-squares bearing intersection
//!
//! Every locator contributes a ray from its coordinate along the measured
//! direction. The solution is the point minimizing the summed squared
//! perpendicular distance to all rays; a distance measurement adds the point
//! on the ray at that range as an extra constraint.

use super::{Axis, EstimatorError, LocatorHandle, MeasurementKind, PositionEstimator};
use crate::domain::models::{Coordinate, Orientation};
use nalgebra::{Matrix3, Rotation3, Vector3};

const DEGENERATE_DETERMINANT: f64 = 1e-9;

#[derive(Debug, Clone)]
struct LocatorGeometry {
    position: Vector3<f64>,
    rotation: Rotation3<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Measurement {
    azimuth: Option<f32>,
    elevation: Option<f32>,
    distance: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct RayIntersection {
    locators: Vec<LocatorGeometry>,
    measurements: Vec<Measurement>,
    result: Option<Vector3<f64>>,
}

impl RayIntersection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unit direction in site coordinates for angles measured in the locator frame
    fn direction(locator: &LocatorGeometry, azimuth_deg: f32, elevation_deg: f32) -> Vector3<f64> {
        let az = (azimuth_deg as f64).to_radians();
        let el = (elevation_deg as f64).to_radians();
        let local = Vector3::new(el.cos() * az.cos(), el.cos() * az.sin(), el.sin());
        locator.rotation * local
    }
}

impl PositionEstimator for RayIntersection {
    fn register_locator(
        &mut self,
        coordinate: Coordinate,
        orientation: Orientation,
    ) -> Result<LocatorHandle, EstimatorError> {
        let rotation = Rotation3::from_euler_angles(
            (orientation.x as f64).to_radians(),
            (orientation.y as f64).to_radians(),
            (orientation.z as f64).to_radians(),
        );
        self.locators.push(LocatorGeometry {
            position: Vector3::new(coordinate.x as f64, coordinate.y as f64, coordinate.z as f64),
            rotation,
        });
        self.measurements.push(Measurement::default());
        Ok(LocatorHandle(self.locators.len() - 1))
    }

    fn set_measurement(
        &mut self,
        locator: LocatorHandle,
        kind: MeasurementKind,
        value: f32,
    ) -> Result<(), EstimatorError> {
        let measurement = self
            .measurements
            .get_mut(locator.0)
            .ok_or(EstimatorError::UnknownLocator(locator))?;
        if !value.is_finite() {
            return Err(EstimatorError::InvalidParameter {
                name: "measurement",
                value,
            });
        }
        match kind {
            MeasurementKind::Azimuth => measurement.azimuth = Some(value),
            MeasurementKind::Elevation => measurement.elevation = Some(value),
            MeasurementKind::Distance => measurement.distance = Some(value),
        }
        Ok(())
    }

    /// The solve is memoryless, `dt_seconds` is only validated
    fn step(&mut self, dt_seconds: f32) -> Result<(), EstimatorError> {
        if dt_seconds <= 0.0 || !dt_seconds.is_finite() {
            return Err(EstimatorError::InvalidParameter {
                name: "dt_seconds",
                value: dt_seconds,
            });
        }

        let mut normal = Matrix3::<f64>::zeros();
        let mut rhs = Vector3::<f64>::zeros();
        let mut used = 0;

        for (locator, measurement) in self.locators.iter().zip(&self.measurements) {
            let (Some(azimuth), Some(elevation)) = (measurement.azimuth, measurement.elevation) else {
                continue;
            };
            let d = Self::direction(locator, azimuth, elevation);
            let projector = Matrix3::identity() - d * d.transpose();
            normal += projector;
            rhs += projector * locator.position;

            if let Some(distance) = measurement.distance {
                normal += Matrix3::identity();
                rhs += locator.position + d * distance as f64;
            }
            used += 1;
        }

        if used == 0 {
            return Err(EstimatorError::Failed("no locator measurements set".to_string()));
        }
        if normal.determinant().abs() < DEGENERATE_DETERMINANT {
            return Err(EstimatorError::Failed(
                "locator geometry does not constrain a position".to_string(),
            ));
        }

        let solution = normal
            .lu()
            .solve(&rhs)
            .ok_or_else(|| EstimatorError::Failed("position solve failed".to_string()))?;
        self.result = Some(solution);
        Ok(())
    }

    fn result(&self, axis: Axis) -> Result<f32, EstimatorError> {
        let result = self.result.ok_or(EstimatorError::NoResult)?;
        let value = match axis {
            Axis::X => result.x,
            Axis::Y => result.y,
            Axis::Z => result.z,
        };
        Ok(value as f32)
    }

    fn clear_measurements(&mut self) -> Result<(), EstimatorError> {
        self.measurements.fill(Measurement::default());
        Ok(())
    }
}
