//! Static registry of the locators known to this gateway

use crate::domain::models::{Coordinate, DeviceId, Orientation};
use crate::domain::settings::{LocatorConfig, MAX_NUM_LOCATORS};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    pub id: DeviceId,
    pub coordinate: Coordinate,
    pub orientation: Orientation,
}

/// Position of a locator in registry order
///
/// Tags keep one measurement slot per locator, addressed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocatorSlot(usize);

impl LocatorSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Read-only after startup
#[derive(Debug, Clone, Default)]
pub struct LocatorRegistry {
    locators: Vec<Locator>,
}

impl LocatorRegistry {
    pub fn from_config(configs: &[LocatorConfig]) -> Self {
        if configs.len() > MAX_NUM_LOCATORS {
            warn!(
                "Ignoring {} locators beyond the limit of {}",
                configs.len() - MAX_NUM_LOCATORS,
                MAX_NUM_LOCATORS
            );
        }

        let locators: Vec<Locator> = configs
            .iter()
            .take(MAX_NUM_LOCATORS)
            .map(|c| Locator {
                id: DeviceId::new(c.id.clone()),
                coordinate: c.coordinate,
                orientation: c.orientation,
            })
            .collect();

        for locator in &locators {
            info!(
                "Locator added: id: {}, coordinate: {} {} {}, orientation: {} {} {}",
                locator.id,
                locator.coordinate.x,
                locator.coordinate.y,
                locator.coordinate.z,
                locator.orientation.x,
                locator.orientation.y,
                locator.orientation.z
            );
        }
        info!("Locator count: {}", locators.len());

        Self { locators }
    }

    pub fn slot_of(&self, id: &DeviceId) -> Option<LocatorSlot> {
        self.locators
            .iter()
            .position(|l| &l.id == id)
            .map(LocatorSlot)
    }

    pub fn get(&self, slot: LocatorSlot) -> Option<&Locator> {
        self.locators.get(slot.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocatorSlot, &Locator)> {
        self.locators
            .iter()
            .enumerate()
            .map(|(i, l)| (LocatorSlot(i), l))
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }
}
