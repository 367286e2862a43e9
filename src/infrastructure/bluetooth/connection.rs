//! Per-link discovery state machine
//!
//! Each connected tag walks through service discovery, characteristic
//! discovery and notification enabling, driven by the radio's procedure
//! completed events. Once running, IQ reports are routed to one
//! [`LocatorSession`] per locator radio address.

use crate::domain::angle::{AngleError, DistanceModel, LocatorSession};
use crate::domain::iq::IqGeometry;
use crate::domain::models::{AddressType, AngleObservation, BdAddr, DeviceId};
use crate::domain::settings::MAX_NUM_LOCATORS;
use crate::estimation::{EstimatorError, EstimatorFactory};
use crate::infrastructure::bluetooth::protocol::{
    ConnectionHandle, IqReport, RadioCommand, IQ_CHARACTERISTIC_UUID, IQ_SERVICE_UUID,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    DiscoverServices,
    DiscoverCharacteristics,
    EnableNotifications,
    Running,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DiscoverServices => "discover services",
            Self::DiscoverCharacteristics => "discover characteristics",
            Self::EnableNotifications => "enable notifications",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("CTE service not found")]
    ServiceNotFound,
    #[error("IQ report characteristic not found")]
    CharacteristicNotFound,
    #[error("GATT procedure failed in state {state}: {result:#06x}")]
    ProcedureFailed { state: ConnectionState, result: u16 },
}

#[derive(Debug, Error)]
pub enum IqError {
    #[error("locator session limit reached, ignoring locator {0}")]
    SessionLimit(BdAddr),
    #[error("could not create locator session: {0}")]
    Session(#[from] EstimatorError),
    #[error(transparent)]
    Angle(#[from] AngleError),
}

/// Parameters handed to every new locator session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub geometry: IqGeometry,
    pub filtering_amount: f32,
    pub distance: DistanceModel,
}

/// One active link to a tag
pub struct Connection {
    handle: ConnectionHandle,
    address: BdAddr,
    address_type: AddressType,
    tag_id: DeviceId,
    state: ConnectionState,
    service: Option<u32>,
    characteristic: Option<u16>,
    sessions: HashMap<BdAddr, LocatorSession>,
    opened_at: Instant,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
        opened_at: Instant,
    ) -> Self {
        Self {
            handle,
            address,
            address_type,
            tag_id: DeviceId::from_address(&address, address_type),
            state: ConnectionState::DiscoverServices,
            service: None,
            characteristic: None,
            sessions: HashMap::new(),
            opened_at,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn tag_id(&self) -> &DeviceId {
        &self.tag_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// First command of the discovery sequence
    pub fn start_discovery(&self) -> RadioCommand {
        RadioCommand::DiscoverPrimaryServicesByUuid {
            connection: self.handle,
            uuid: IQ_SERVICE_UUID.to_vec(),
        }
    }

    pub fn on_service(&mut self, service: u32, uuid: &[u8]) {
        if self.state != ConnectionState::DiscoverServices {
            debug!("Connection {}: service event while {}, ignored", self.handle, self.state);
            return;
        }
        if uuid == IQ_SERVICE_UUID {
            debug!("Connection {}: CTE service {:#x}", self.handle, service);
            self.service = Some(service);
        }
    }

    pub fn on_characteristic(&mut self, characteristic: u16, uuid: &[u8]) {
        if self.state != ConnectionState::DiscoverCharacteristics {
            debug!(
                "Connection {}: characteristic event while {}, ignored",
                self.handle, self.state
            );
            return;
        }
        if uuid == IQ_CHARACTERISTIC_UUID {
            debug!("Connection {}: IQ characteristic {:#x}", self.handle, characteristic);
            self.characteristic = Some(characteristic);
        }
    }

    /// Advance on a completed GATT procedure
    ///
    /// Returns the next command to send, or `None` when nothing follows.
    pub fn on_procedure_completed(
        &mut self,
        result: u16,
    ) -> Result<Option<RadioCommand>, DiscoveryError> {
        if self.state == ConnectionState::Running {
            trace!("Connection {}: procedure completed while running", self.handle);
            return Ok(None);
        }
        if result != 0 {
            return Err(DiscoveryError::ProcedureFailed {
                state: self.state,
                result,
            });
        }

        let command = match self.state {
            ConnectionState::DiscoverServices => {
                let service = self.service.ok_or(DiscoveryError::ServiceNotFound)?;
                self.state = ConnectionState::DiscoverCharacteristics;
                Some(RadioCommand::DiscoverCharacteristicsByUuid {
                    connection: self.handle,
                    service,
                    uuid: IQ_CHARACTERISTIC_UUID.to_vec(),
                })
            }
            ConnectionState::DiscoverCharacteristics => {
                let characteristic = self
                    .characteristic
                    .ok_or(DiscoveryError::CharacteristicNotFound)?;
                self.state = ConnectionState::EnableNotifications;
                Some(RadioCommand::SetCharacteristicNotification {
                    connection: self.handle,
                    characteristic,
                    enable: true,
                })
            }
            ConnectionState::EnableNotifications => {
                self.state = ConnectionState::Running;
                info!("Connection {} to {} running", self.handle, self.tag_id);
                None
            }
            ConnectionState::Running => None,
        };
        Ok(command)
    }

    pub fn is_iq_characteristic(&self, characteristic: u16) -> bool {
        self.state == ConnectionState::Running && self.characteristic == Some(characteristic)
    }

    pub fn is_discovery_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.state != ConnectionState::Running && now.saturating_duration_since(self.opened_at) >= timeout
    }

    /// Route an IQ report to the session of the locator that captured it
    pub fn handle_iq_report(
        &mut self,
        report: &IqReport,
        factory: &dyn EstimatorFactory,
        config: &SessionConfig,
    ) -> Result<Option<AngleObservation>, IqError> {
        let address = report.locator_address;
        let session_count = self.sessions.len();
        let session = match self.sessions.entry(address) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if session_count >= MAX_NUM_LOCATORS {
                    return Err(IqError::SessionLimit(address));
                }
                let locator_id = DeviceId::from_address(&address, report.locator_address_type);
                let session = LocatorSession::new(
                    address,
                    locator_id.clone(),
                    config.geometry,
                    factory,
                    config.filtering_amount,
                )?;
                info!("Connection {}: new locator session for {}", self.handle, locator_id);
                entry.insert(session)
            }
        };
        Ok(session.compute(&self.tag_id, report.capture(), config.distance)?)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("tag_id", &self.tag_id)
            .field("state", &self.state)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
