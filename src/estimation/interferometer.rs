//! Phase interferometer angle estimator
//!
//! Derotates the antenna samples with the phase advance measured in the
//! reference period, then averages the phase difference between horizontally
//! and vertically neighbouring elements over several packets. Complex values
//! are `(re, im)` tuples.

use super::{AngleEstimate, AngleEstimator, Angles, EstimatorError, QualityFlags};
use crate::domain::iq::ArrayType;
use crate::domain::settings::AzimuthMask;
use std::f64::consts::PI;

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Antenna samples are taken every second reference-sample period
const ANTENNA_SAMPLE_SPACING: f64 = 2.0;

const REFERENCE_JITTER_LIMIT: f64 = 0.35;
const ANTENNA_JITTER_LIMIT: f64 = 0.5;
const MIN_REFERENCE_AMPLITUDE: f64 = 0.05;

/// Side length of the element grid all supported boards map onto
const GRID: usize = 4;

type Complex = (f64, f64);

#[inline]
fn cmul(a: Complex, b: Complex) -> Complex {
    (a.0 * b.0 - a.1 * b.1, a.0 * b.1 + a.1 * b.0)
}

#[inline]
fn cadd(a: Complex, b: Complex) -> Complex {
    (a.0 + b.0, a.1 + b.1)
}

#[inline]
fn conj(a: Complex) -> Complex {
    (a.0, -a.1)
}

#[inline]
fn arg(a: Complex) -> f64 {
    a.1.atan2(a.0)
}

#[inline]
fn norm(a: Complex) -> f64 {
    a.0.hypot(a.1)
}

fn wrap_phase(phase: f64) -> f64 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

/// Circular standard deviation of a set of phases
fn circular_spread(phases: &[f64]) -> f64 {
    if phases.is_empty() {
        return 0.0;
    }
    let sum = phases
        .iter()
        .fold((0.0, 0.0), |acc, p| cadd(acc, (p.cos(), p.sin())));
    let resultant = (norm(sum) / phases.len() as f64).clamp(1e-12, 1.0);
    (-2.0 * resultant.ln()).sqrt()
}

pub struct PhaseInterferometer {
    /// `(row, col)` of each switched antenna on the element grid
    elements: Vec<(usize, usize)>,
    linear: bool,
    spacing_m: f64,
    packets_per_estimate: u32,
    azimuth_mask: Option<AzimuthMask>,
    acc_x: Complex,
    acc_y: Complex,
    packets: u32,
    quality: QualityFlags,
}

impl PhaseInterferometer {
    pub fn new(
        array_type: ArrayType,
        spacing_m: f32,
        packets_per_estimate: u32,
    ) -> Result<Self, EstimatorError> {
        if spacing_m <= 0.0 || !spacing_m.is_finite() {
            return Err(EstimatorError::InvalidParameter {
                name: "element_spacing_m",
                value: spacing_m,
            });
        }
        if packets_per_estimate == 0 {
            return Err(EstimatorError::InvalidParameter {
                name: "packets_per_estimate",
                value: 0.0,
            });
        }

        let elements = array_type
            .switching_pattern()
            .iter()
            .map(|&p| (p as usize / GRID, p as usize % GRID))
            .collect();

        Ok(Self {
            elements,
            linear: array_type.is_linear(),
            spacing_m: spacing_m as f64,
            packets_per_estimate,
            azimuth_mask: None,
            acc_x: (0.0, 0.0),
            acc_y: (0.0, 0.0),
            packets: 0,
            quality: QualityFlags::default(),
        })
    }

    pub fn with_azimuth_mask(mut self, mask: Option<AzimuthMask>) -> Self {
        self.azimuth_mask = mask;
        self
    }

    fn reset_accumulators(&mut self) {
        self.acc_x = (0.0, 0.0);
        self.acc_y = (0.0, 0.0);
        self.packets = 0;
    }

    fn solve(&self, acc_x: Complex, acc_y: Complex, center_frequency_hz: f64) -> Angles {
        let wavelength = SPEED_OF_LIGHT / center_frequency_hz;
        let scale = wavelength / (2.0 * PI * self.spacing_m);
        let ux = (arg(acc_x) * scale).clamp(-1.0, 1.0);

        if self.linear {
            return Angles {
                azimuth: ux.asin().to_degrees() as f32,
                elevation: 0.0,
            };
        }

        let uy = if norm(acc_y) > 0.0 {
            (arg(acc_y) * scale).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let radial = ux.hypot(uy).min(1.0);
        Angles {
            azimuth: uy.atan2(ux).to_degrees() as f32,
            elevation: radial.acos().to_degrees() as f32,
        }
    }
}

impl AngleEstimator for PhaseInterferometer {
    fn compute_phase_rotation(&mut self, ref_i: &[f32], ref_q: &[f32]) -> Result<f32, EstimatorError> {
        self.quality = QualityFlags::default();

        let samples: Vec<Complex> = ref_i
            .iter()
            .zip(ref_q)
            .map(|(&i, &q)| (i as f64, q as f64))
            .collect();
        if samples.len() < 2 {
            return Err(EstimatorError::Failed(
                "reference period too short".to_string(),
            ));
        }

        let amplitude = samples.iter().map(|&s| norm(s)).sum::<f64>() / samples.len() as f64;
        if amplitude < MIN_REFERENCE_AMPLITUDE {
            self.quality.set(QualityFlags::SNDR);
        }

        let increments: Vec<Complex> = samples
            .windows(2)
            .map(|w| cmul(w[1], conj(w[0])))
            .collect();
        let rotation = arg(increments.iter().fold((0.0, 0.0), |acc, &z| cadd(acc, z)));

        let deviations: Vec<f64> = increments
            .iter()
            .filter(|&&z| norm(z) > 0.0)
            .map(|&z| wrap_phase(arg(z) - rotation))
            .collect();
        if !deviations.is_empty() {
            let rms = (deviations.iter().map(|d| d * d).sum::<f64>() / deviations.len() as f64).sqrt();
            if rms > REFERENCE_JITTER_LIMIT {
                self.quality.set(QualityFlags::REF_ANT_PHASE_JITTER);
            }
        }

        Ok(rotation as f32)
    }

    fn estimate(
        &mut self,
        antenna_i: &[Vec<f32>],
        antenna_q: &[Vec<f32>],
        phase_rotation: f32,
        center_frequency_hz: f64,
    ) -> Result<AngleEstimate, EstimatorError> {
        if center_frequency_hz <= 0.0 || !center_frequency_hz.is_finite() {
            return Err(EstimatorError::InvalidParameter {
                name: "center_frequency_hz",
                value: center_frequency_hz as f32,
            });
        }

        let antennas = self.elements.len();
        let mut snapshot_phases = Vec::with_capacity(antenna_i.len());

        for (snapshot, (row_i, row_q)) in antenna_i.iter().zip(antenna_q).enumerate() {
            let mut cells: [[Option<Complex>; GRID]; GRID] = [[None; GRID]; GRID];
            for (antenna, (&i, &q)) in row_i.iter().zip(row_q).enumerate().take(antennas) {
                let n = (snapshot * antennas + antenna) as f64;
                let derotation = -(phase_rotation as f64) * ANTENNA_SAMPLE_SPACING * n;
                let (row, col) = self.elements[antenna];
                cells[row][col] = Some(cmul(
                    (i as f64, q as f64),
                    (derotation.cos(), derotation.sin()),
                ));
            }

            let mut snap_x = (0.0, 0.0);
            let mut snap_y = (0.0, 0.0);
            for row in 0..GRID {
                for col in 0..GRID {
                    let Some(here) = cells[row][col] else { continue };
                    if let Some(right) = cells[row].get(col + 1).copied().flatten() {
                        snap_x = cadd(snap_x, cmul(right, conj(here)));
                    }
                    if let Some(below) = cells.get(row + 1).and_then(|r| r[col]) {
                        snap_y = cadd(snap_y, cmul(below, conj(here)));
                    }
                }
            }

            if norm(snap_x) > 0.0 {
                snapshot_phases.push(arg(snap_x));
            }
            self.acc_x = cadd(self.acc_x, snap_x);
            self.acc_y = cadd(self.acc_y, snap_y);
        }

        if circular_spread(&snapshot_phases) > ANTENNA_JITTER_LIMIT {
            self.quality.set(QualityFlags::ANT_X_PHASE_JITTER);
        }

        self.packets += 1;
        if self.packets < self.packets_per_estimate {
            return Ok(AngleEstimate::InProgress);
        }

        let (acc_x, acc_y) = (self.acc_x, self.acc_y);
        self.reset_accumulators();

        if norm(acc_x) < 1e-12 {
            return Err(EstimatorError::Failed(
                "no phase information in antenna samples".to_string(),
            ));
        }

        let angles = self.solve(acc_x, acc_y, center_frequency_hz);
        if let Some(mask) = self.azimuth_mask {
            if mask.contains(angles.azimuth) {
                return Err(EstimatorError::Failed(format!(
                    "azimuth {:.1} falls inside the configured mask",
                    angles.azimuth
                )));
            }
        }

        Ok(AngleEstimate::Ready(angles))
    }

    fn quality(&self) -> QualityFlags {
        self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: f32 = 0.04;
    const FREQ: f64 = 2_440_000_000.0;

    fn plane_wave(array: ArrayType, ux: f64, uy: f64, rotation: f64) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let geometry = array.geometry();
        let k = 2.0 * PI * SPACING as f64 / (SPEED_OF_LIGHT / FREQ);
        let mut grid_i = vec![vec![0.0; geometry.antennas]; geometry.snapshots];
        let mut grid_q = grid_i.clone();
        for snapshot in 0..geometry.snapshots {
            for (antenna, &p) in array.switching_pattern().iter().enumerate() {
                let (row, col) = ((p as usize / GRID) as f64, (p as usize % GRID) as f64);
                let n = (snapshot * geometry.antennas + antenna) as f64;
                let phase = k * (ux * col + uy * row) + rotation * ANTENNA_SAMPLE_SPACING * n;
                grid_i[snapshot][antenna] = (0.5 * phase.cos()) as f32;
                grid_q[snapshot][antenna] = (0.5 * phase.sin()) as f32;
            }
        }
        (grid_i, grid_q)
    }

    fn direction(azimuth_deg: f64, elevation_deg: f64) -> (f64, f64) {
        let (az, el) = (azimuth_deg.to_radians(), elevation_deg.to_radians());
        (el.cos() * az.cos(), el.cos() * az.sin())
    }

    #[test]
    fn test_recovers_plane_wave_direction() {
        let mut estimator = PhaseInterferometer::new(ArrayType::Ura4x4, SPACING, 1).unwrap();
        let (ux, uy) = direction(30.0, 60.0);
        let (i, q) = plane_wave(ArrayType::Ura4x4, ux, uy, 0.0);

        match estimator.estimate(&i, &q, 0.0, FREQ).unwrap() {
            AngleEstimate::Ready(angles) => {
                assert!((angles.azimuth - 30.0).abs() < 0.5, "azimuth {}", angles.azimuth);
                assert!((angles.elevation - 60.0).abs() < 0.5, "elevation {}", angles.elevation);
            }
            AngleEstimate::InProgress => panic!("expected an angle"),
        }
    }

    #[test]
    fn test_reports_in_progress_until_enough_packets() {
        let mut estimator = PhaseInterferometer::new(ArrayType::Ura3x3, SPACING, 3).unwrap();
        let (ux, uy) = direction(-45.0, 50.0);
        let (i, q) = plane_wave(ArrayType::Ura3x3, ux, uy, 0.0);

        assert_eq!(estimator.estimate(&i, &q, 0.0, FREQ).unwrap(), AngleEstimate::InProgress);
        assert_eq!(estimator.estimate(&i, &q, 0.0, FREQ).unwrap(), AngleEstimate::InProgress);
        assert!(matches!(
            estimator.estimate(&i, &q, 0.0, FREQ).unwrap(),
            AngleEstimate::Ready(_)
        ));
        // Accumulation restarts after each reported angle
        assert_eq!(estimator.estimate(&i, &q, 0.0, FREQ).unwrap(), AngleEstimate::InProgress);
    }

    #[test]
    fn test_phase_rotation_is_measured_and_removed() {
        let rotation = 0.3f64;
        let ref_i: Vec<f32> = (0..7).map(|k| (rotation * k as f64).cos() as f32).collect();
        let ref_q: Vec<f32> = (0..7).map(|k| (rotation * k as f64).sin() as f32).collect();

        let mut estimator = PhaseInterferometer::new(ArrayType::Ura4x4, SPACING, 1).unwrap();
        let measured = estimator.compute_phase_rotation(&ref_i, &ref_q).unwrap();
        assert!((measured as f64 - rotation).abs() < 1e-4);
        assert_eq!(estimator.quality(), QualityFlags(0));

        let (ux, uy) = direction(120.0, 70.0);
        let (i, q) = plane_wave(ArrayType::Ura4x4, ux, uy, rotation);
        let AngleEstimate::Ready(angles) = estimator.estimate(&i, &q, measured, FREQ).unwrap() else {
            panic!("expected an angle");
        };
        assert!((angles.azimuth - 120.0).abs() < 0.5, "azimuth {}", angles.azimuth);
        assert!((angles.elevation - 70.0).abs() < 0.5, "elevation {}", angles.elevation);
    }

    #[test]
    fn test_linear_array_reports_azimuth_only() {
        let mut estimator = PhaseInterferometer::new(ArrayType::Ula1x4, SPACING, 1).unwrap();
        let ux = 20f64.to_radians().sin();
        let (i, q) = plane_wave(ArrayType::Ula1x4, ux, 0.0, 0.0);
        let AngleEstimate::Ready(angles) = estimator.estimate(&i, &q, 0.0, FREQ).unwrap() else {
            panic!("expected an angle");
        };
        assert!((angles.azimuth - 20.0).abs() < 0.5);
        assert_eq!(angles.elevation, 0.0);
    }

    #[test]
    fn test_silent_capture_fails() {
        let geometry = ArrayType::Ura4x4.geometry();
        let zeros = vec![vec![0.0; geometry.antennas]; geometry.snapshots];
        let mut estimator = PhaseInterferometer::new(ArrayType::Ura4x4, SPACING, 1).unwrap();
        assert!(estimator.estimate(&zeros, &zeros, 0.0, FREQ).is_err());

        estimator.compute_phase_rotation(&[0.0; 7], &[0.0; 7]).unwrap();
        assert!(estimator.quality().is_set(QualityFlags::SNDR));
    }

    #[test]
    fn test_azimuth_mask_rejects_estimate() {
        let mut estimator = PhaseInterferometer::new(ArrayType::Ura4x4, SPACING, 1)
            .unwrap()
            .with_azimuth_mask(Some(AzimuthMask { min: 20.0, max: 40.0 }));
        let (ux, uy) = direction(30.0, 60.0);
        let (i, q) = plane_wave(ArrayType::Ura4x4, ux, uy, 0.0);
        assert!(matches!(
            estimator.estimate(&i, &q, 0.0, FREQ),
            Err(EstimatorError::Failed(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(PhaseInterferometer::new(ArrayType::Ura4x4, 0.0, 1).is_err());
        assert!(PhaseInterferometer::new(ArrayType::Ura4x4, SPACING, 0).is_err());
    }
}
