//! Per-(tag, locator) angle pipeline

use crate::domain::iq::{IqBuffers, IqGeometry};
use crate::domain::models::{AngleObservation, BdAddr, DeviceId};
use crate::estimation::{
    AngleEstimate, AngleEstimator, EstimatorError, EstimatorFactory, IqQuality, SmoothingFilter,
};
use thiserror::Error;
use tracing::{debug, trace};

/// Physical channel index for each logical BLE channel
const PHYSICAL_CHANNELS: [u8; 40] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
    28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 0, 12, 39,
];

const BASE_FREQUENCY_HZ: f64 = 2_402_000_000.0;
const CHANNEL_SPACING_HZ: f64 = 2_000_000.0;

/// RF center frequency of a logical BLE channel, `None` above channel 39
pub fn channel_to_frequency(channel: u8) -> Option<f64> {
    let physical = *PHYSICAL_CHANNELS.get(channel as usize)?;
    Some(BASE_FREQUENCY_HZ + CHANNEL_SPACING_HZ * physical as f64)
}

/// Log-distance path loss model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceModel {
    /// RSSI at 1.0 m in dBm
    pub tx_power_dbm: f32,
    pub path_loss_exponent: f32,
}

impl DistanceModel {
    /// Raw distance in meters for a received signal strength
    pub fn distance(&self, rssi_dbm: f32) -> f32 {
        10f32.powf((self.tx_power_dbm - rssi_dbm) / (10.0 * self.path_loss_exponent))
    }
}

#[derive(Debug, Error)]
pub enum AngleError {
    #[error("channel {0} is not a BLE channel")]
    InvalidChannel(u8),
    #[error("angle estimation failed: {0}")]
    Estimator(#[from] EstimatorError),
}

/// One CTE capture as delivered by a locator radio
#[derive(Debug, Clone, Copy)]
pub struct IqCapture<'a> {
    pub samples: &'a [i8],
    pub channel: u8,
    pub rssi: i8,
    pub sequence: u16,
}

/// Angle estimation state for one locator radio seen on a connection
pub struct LocatorSession {
    locator_address: BdAddr,
    locator_id: DeviceId,
    estimator: Box<dyn AngleEstimator>,
    distance_filter: Box<dyn SmoothingFilter>,
    buffers: IqBuffers,
}

impl LocatorSession {
    pub fn new(
        locator_address: BdAddr,
        locator_id: DeviceId,
        geometry: IqGeometry,
        factory: &dyn EstimatorFactory,
        filtering_amount: f32,
    ) -> Result<Self, EstimatorError> {
        let estimator = factory.angle_estimator()?;
        let mut distance_filter = factory.smoothing_filter()?;
        distance_filter.configure(filtering_amount)?;

        Ok(Self {
            locator_address,
            locator_id,
            estimator,
            distance_filter,
            buffers: IqBuffers::new(geometry),
        })
    }

    pub fn locator_address(&self) -> BdAddr {
        self.locator_address
    }

    pub fn locator_id(&self) -> &DeviceId {
        &self.locator_id
    }

    /// Run one capture through demultiplexing and angle estimation
    ///
    /// `Ok(None)` means the estimator needs more captures before it can
    /// report an angle.
    pub fn compute(
        &mut self,
        tag_id: &DeviceId,
        capture: IqCapture<'_>,
        model: DistanceModel,
    ) -> Result<Option<AngleObservation>, AngleError> {
        let frequency = channel_to_frequency(capture.channel)
            .ok_or(AngleError::InvalidChannel(capture.channel))?;

        let outcome = self.buffers.demultiplex(capture.samples);
        if !outcome.is_complete() {
            debug!(
                "Short IQ capture from {}: {} of {} samples",
                self.locator_id, outcome.consumed, outcome.required
            );
        }

        let rotation = self
            .estimator
            .compute_phase_rotation(self.buffers.reference_i(), self.buffers.reference_q())?;

        let angles = match self.estimator.estimate(
            self.buffers.antenna_i(),
            self.buffers.antenna_q(),
            rotation,
            frequency,
        )? {
            AngleEstimate::Ready(angles) => angles,
            AngleEstimate::InProgress => {
                trace!("Angle estimation in progress for {} via {}", tag_id, self.locator_id);
                return Ok(None);
            }
        };

        let raw_distance = model.distance(capture.rssi as f32);
        let distance = self.distance_filter.apply(raw_distance);

        let quality = IqQuality::from(self.estimator.quality());
        debug!(
            "tag: {}, locator: {}, azimuth: {:.1}, elevation: {:.1}, distance: {:.2}, rssi: {}, ch: {}, seq: {}, IQ quality: {}",
            tag_id,
            self.locator_id,
            angles.azimuth,
            angles.elevation,
            distance,
            capture.rssi,
            capture.channel,
            capture.sequence,
            quality
        );

        Ok(Some(AngleObservation {
            tag_id: tag_id.clone(),
            locator_id: self.locator_id.clone(),
            azimuth: angles.azimuth,
            elevation: angles.elevation,
            distance,
            rssi: capture.rssi as i16,
            channel: capture.channel as u16,
            sequence: capture.sequence as u32,
        }))
    }
}

impl std::fmt::Debug for LocatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorSession")
            .field("locator_address", &self.locator_address)
            .field("locator_id", &self.locator_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::iq::ArrayType;
    use crate::estimation::testing::StubFactory;

    const MODEL: DistanceModel = DistanceModel {
        tx_power_dbm: -45.0,
        path_loss_exponent: 2.0,
    };

    fn session(factory: &StubFactory) -> LocatorSession {
        LocatorSession::new(
            BdAddr([1, 2, 3, 4, 5, 6]),
            DeviceId::from("locator"),
            ArrayType::Ura4x4.geometry(),
            factory,
            0.6,
        )
        .unwrap()
    }

    fn capture(samples: &[i8]) -> IqCapture<'_> {
        IqCapture {
            samples,
            channel: 37,
            rssi: -45,
            sequence: 9,
        }
    }

    #[test]
    fn test_channel_to_frequency() {
        assert_eq!(channel_to_frequency(37), Some(2_402_000_000.0));
        assert_eq!(channel_to_frequency(39), Some(2_480_000_000.0));
        assert_eq!(channel_to_frequency(0), Some(2_404_000_000.0));
        assert_eq!(channel_to_frequency(11), Some(2_428_000_000.0));
        assert_eq!(channel_to_frequency(40), None);
    }

    #[test]
    fn test_distance_model() {
        assert!((MODEL.distance(-45.0) - 1.0).abs() < 1e-6);
        assert!((MODEL.distance(-65.0) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_in_progress_is_not_an_error() {
        let factory = StubFactory::new();
        factory.control.borrow_mut().in_progress = 1;
        let mut session = session(&factory);
        let samples = vec![10i8; 160];
        let tag = DeviceId::from("tag");

        assert!(session.compute(&tag, capture(&samples), MODEL).unwrap().is_none());

        let observation = session.compute(&tag, capture(&samples), MODEL).unwrap().unwrap();
        assert_eq!(observation.tag_id, tag);
        assert_eq!(observation.locator_id, DeviceId::from("locator"));
        assert_eq!(observation.azimuth, 10.0);
        assert_eq!(observation.elevation, 20.0);
        assert!((observation.distance - 1.0).abs() < 1e-6);
        assert_eq!(observation.channel, 37);
        assert_eq!(observation.sequence, 9);
        assert_eq!(factory.log.borrow().filter_amounts, vec![0.6]);
    }

    #[test]
    fn test_estimator_failure_is_reported() {
        let factory = StubFactory::new();
        factory.control.borrow_mut().fail_angle = true;
        let mut session = session(&factory);
        let result = session.compute(&DeviceId::from("tag"), capture(&[1, 2, 3]), MODEL);
        assert!(matches!(result, Err(AngleError::Estimator(_))));
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let factory = StubFactory::new();
        let mut session = session(&factory);
        let mut bad = capture(&[]);
        bad.channel = 55;
        let result = session.compute(&DeviceId::from("tag"), bad, MODEL);
        assert!(matches!(result, Err(AngleError::InvalidChannel(55))));
    }
}
