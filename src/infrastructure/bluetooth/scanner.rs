//! Scan report filtering
//!
//! Decides which advertising tags the gateway should connect to.

use crate::domain::models::{AddressType, BdAddr, DeviceId};
use crate::infrastructure::bluetooth::protocol::{self, IQ_SERVICE_UUID};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Connect,
    NotAllowed,
    NotConnectable,
    MissingService,
}

/// Static part of the connect decision
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    allowlist: Vec<DeviceId>,
}

impl ScanFilter {
    /// An empty allow list accepts every tag
    pub fn new(allowlist: &[String]) -> Self {
        Self {
            allowlist: allowlist.iter().map(|id| DeviceId::new(id.as_str())).collect(),
        }
    }

    pub fn is_allowed(&self, id: &DeviceId) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(id)
    }

    pub fn evaluate(
        &self,
        address: &BdAddr,
        address_type: AddressType,
        packet_type: u8,
        data: &[u8],
    ) -> ScanVerdict {
        let id = DeviceId::from_address(address, address_type);
        if !self.is_allowed(&id) {
            trace!("Ignoring {}: not on the allow list", id);
            return ScanVerdict::NotAllowed;
        }
        if !protocol::is_connectable(packet_type) {
            trace!("Ignoring {}: non-connectable packet type {:#04x}", id, packet_type);
            return ScanVerdict::NotConnectable;
        }
        if !protocol::find_service_in_advertisement(data, &IQ_SERVICE_UUID) {
            trace!("Ignoring {}: no CTE service advertised", id);
            return ScanVerdict::MissingService;
        }
        debug!("Found tag {} ({})", id, address_type);
        ScanVerdict::Connect
    }
}
