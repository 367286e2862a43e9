//! Per-tag readiness gate
//!
//! Every tag keeps the latest observation from each configured locator. Once
//! all locators have reported since the last fix, the observations go to the
//! tag's position estimator and the smoothed result is returned.

use crate::domain::locators::{LocatorRegistry, LocatorSlot};
use crate::domain::models::{AngleObservation, DeviceId, Position, PositionResult};
use crate::domain::settings::MAX_NUM_TAGS;
use crate::estimation::{
    Axis, EstimatorError, EstimatorFactory, LocatorHandle, MeasurementKind, PositionEstimator,
    SmoothingFilter,
};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("observation from unknown locator {0}")]
    UnknownLocator(DeviceId),
    #[error("tag capacity reached, dropping {0}")]
    TagCapacityReached(DeviceId),
    #[error("position estimation failed: {0}")]
    Estimator(#[from] EstimatorError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorConfig {
    pub filtering_amount: f32,
    pub estimation_interval_sec: f32,
}

struct Tag {
    id: DeviceId,
    observations: Vec<Option<AngleObservation>>,
    ready: Vec<bool>,
    /// Estimator handle per locator slot
    handles: Vec<LocatorHandle>,
    estimator: Box<dyn PositionEstimator>,
    filters: [Box<dyn SmoothingFilter>; 3],
    position: Option<Position>,
}

impl Tag {
    fn new(
        id: DeviceId,
        locators: &LocatorRegistry,
        factory: &dyn EstimatorFactory,
        config: &AggregatorConfig,
    ) -> Result<Self, EstimatorError> {
        let mut estimator = factory.position_estimator()?;
        let handles = locators
            .iter()
            .map(|(_, locator)| estimator.register_locator(locator.coordinate, locator.orientation))
            .collect::<Result<Vec<_>, _>>()?;

        let mut filters = [
            factory.smoothing_filter()?,
            factory.smoothing_filter()?,
            factory.smoothing_filter()?,
        ];
        for filter in filters.iter_mut() {
            filter.configure(config.filtering_amount)?;
        }

        Ok(Self {
            id,
            observations: vec![None; locators.len()],
            ready: vec![false; locators.len()],
            handles,
            estimator,
            filters,
            position: None,
        })
    }

    fn record(&mut self, slot: LocatorSlot, observation: AngleObservation) {
        self.observations[slot.index()] = Some(observation);
        self.ready[slot.index()] = true;
    }

    fn is_ready(&self) -> bool {
        self.ready.iter().all(|r| *r)
    }

    fn solve(&mut self, with_distance: bool, dt: f32) -> Result<Position, EstimatorError> {
        for (observation, handle) in self.observations.iter().zip(&self.handles) {
            let Some(observation) = observation else {
                return Err(EstimatorError::NoResult);
            };
            self.estimator
                .set_measurement(*handle, MeasurementKind::Azimuth, observation.azimuth)?;
            self.estimator
                .set_measurement(*handle, MeasurementKind::Elevation, observation.elevation)?;
            // RSSI distance only helps when nothing else constrains the range
            if with_distance {
                self.estimator
                    .set_measurement(*handle, MeasurementKind::Distance, observation.distance)?;
            }
        }

        self.estimator.step(dt)?;

        let mut raw = [0.0f32; 3];
        for (value, axis) in raw.iter_mut().zip(Axis::ALL) {
            *value = self.estimator.result(axis)?;
        }
        let [x, y, z] = raw;

        Ok(Position {
            x: self.filters[0].apply(x),
            y: self.filters[1].apply(y),
            z: self.filters[2].apply(z),
        })
    }

    fn compute(&mut self, with_distance: bool, dt: f32) -> Result<Position, EstimatorError> {
        let result = self.solve(with_distance, dt);
        let cleared = self.estimator.clear_measurements();

        let position = result?;
        cleared?;
        self.ready.fill(false);
        self.position = Some(position);
        Ok(position)
    }
}

/// Bounded table of tracked tags
pub struct TagAggregator {
    locators: LocatorRegistry,
    factory: Rc<dyn EstimatorFactory>,
    config: AggregatorConfig,
    tags: Vec<Tag>,
}

impl TagAggregator {
    pub fn new(
        locators: LocatorRegistry,
        factory: Rc<dyn EstimatorFactory>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            locators,
            factory,
            config,
            tags: Vec::new(),
        }
    }

    pub fn locators(&self) -> &LocatorRegistry {
        &self.locators
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn last_position(&self, tag_id: &DeviceId) -> Option<Position> {
        self.tags
            .iter()
            .find(|t| &t.id == tag_id)
            .and_then(|t| t.position)
    }

    /// Locator slots of `tag_id` still waiting for an observation this round
    pub fn pending_slots(&self, tag_id: &DeviceId) -> Option<Vec<LocatorSlot>> {
        let tag = self.tags.iter().find(|t| &t.id == tag_id)?;
        Some(
            self.locators
                .iter()
                .filter(|(slot, _)| !tag.ready[slot.index()])
                .map(|(slot, _)| slot)
                .collect(),
        )
    }

    fn tag_index(&mut self, tag_id: &DeviceId) -> Result<usize, AggregatorError> {
        if let Some(index) = self.tags.iter().position(|t| &t.id == tag_id) {
            return Ok(index);
        }
        if self.tags.len() >= MAX_NUM_TAGS {
            return Err(AggregatorError::TagCapacityReached(tag_id.clone()));
        }

        let tag = Tag::new(
            tag_id.clone(),
            &self.locators,
            self.factory.as_ref(),
            &self.config,
        )?;
        info!("Tracking new tag {}", tag_id);
        self.tags.push(tag);
        Ok(self.tags.len() - 1)
    }

    /// Record one observation, returning a fix once every locator has reported
    pub fn ingest(
        &mut self,
        observation: AngleObservation,
    ) -> Result<Option<PositionResult>, AggregatorError> {
        let slot = self
            .locators
            .slot_of(&observation.locator_id)
            .ok_or_else(|| AggregatorError::UnknownLocator(observation.locator_id.clone()))?;
        let index = self.tag_index(&observation.tag_id)?;

        let with_distance = self.locators.len() == 1;
        let dt = self.config.estimation_interval_sec;
        let tag = &mut self.tags[index];
        tag.record(slot, observation);
        if !tag.is_ready() {
            return Ok(None);
        }

        match tag.compute(with_distance, dt) {
            Ok(position) => {
                debug!(
                    "Position of {}: {:.2} {:.2} {:.2}",
                    tag.id, position.x, position.y, position.z
                );
                Ok(Some(PositionResult {
                    tag_id: tag.id.clone(),
                    position,
                }))
            }
            Err(e) => {
                warn!("Position round for {} failed, keeping observations", tag.id);
                Err(e.into())
            }
        }
    }
}
