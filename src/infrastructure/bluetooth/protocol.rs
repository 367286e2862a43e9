//! Radio bridge protocol
//!
//! Event and command vocabulary exchanged with the BLE radio, the GATT
//! identifiers of the CTE/IQ service, and decoding of advertisement data and
//! IQ reports.

use crate::domain::angle::IqCapture;
use crate::domain::models::{AddressType, BdAddr};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// CTE service UUID, in over-the-air (little-endian) byte order
pub const IQ_SERVICE_UUID: [u8; 16] = [
    0x45, 0x22, 0x6e, 0x06, 0x61, 0xf3, 0x14, 0x92, 0x10, 0x7b, 0xc1, 0x37, 0x37, 0x62, 0x9f, 0x02,
];

/// IQ report characteristic UUID, in over-the-air (little-endian) byte order
pub const IQ_CHARACTERISTIC_UUID: [u8; 16] = [
    0xd2, 0x3a, 0x55, 0x80, 0x3b, 0xaf, 0x99, 0x21, 0x06, 0xc2, 0x8b, 0x39, 0xcc, 0x62, 0x8c, 0x77,
];

/// AD type: incomplete list of 128-bit service UUIDs
pub const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
/// AD type: complete list of 128-bit service UUIDs
pub const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;

/// Scan report packet type bits that mark a non-connectable advertisement
const NON_CONNECTABLE_MASK: u8 = 0x06;

/// Transport-assigned connection handle
///
/// The radio reuses handles once a link closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(pub u16);

impl ConnectionHandle {
    pub const INVALID: ConnectionHandle = ConnectionHandle(0xFFFF);
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events reported by the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RadioEvent {
    SystemBoot {
        #[serde(default)]
        version: String,
        address: BdAddr,
        address_type: AddressType,
    },
    ScanReport {
        address: BdAddr,
        address_type: AddressType,
        packet_type: u8,
        #[serde(default)]
        rssi: i8,
        data: Vec<u8>,
    },
    ConnectionOpened {
        connection: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
    },
    ConnectionClosed {
        connection: ConnectionHandle,
        #[serde(default)]
        reason: u16,
    },
    GattService {
        connection: ConnectionHandle,
        service: u32,
        uuid: Vec<u8>,
    },
    GattCharacteristic {
        connection: ConnectionHandle,
        characteristic: u16,
        uuid: Vec<u8>,
    },
    GattProcedureCompleted {
        connection: ConnectionHandle,
        result: u16,
    },
    GattCharacteristicValue {
        connection: ConnectionHandle,
        characteristic: u16,
        value: Vec<u8>,
    },
}

/// Commands sent to the radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RadioCommand {
    SystemReset,
    ConfigureScanner {
        passive: bool,
        interval: u16,
        window: u16,
    },
    SetDefaultConnectionParameters {
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    },
    StartScanner,
    StopScanner,
    OpenConnection {
        address: BdAddr,
        address_type: AddressType,
    },
    CloseConnection {
        connection: ConnectionHandle,
    },
    DiscoverPrimaryServicesByUuid {
        connection: ConnectionHandle,
        uuid: Vec<u8>,
    },
    DiscoverCharacteristicsByUuid {
        connection: ConnectionHandle,
        service: u32,
        uuid: Vec<u8>,
    },
    SetCharacteristicNotification {
        connection: ConnectionHandle,
        characteristic: u16,
        enable: bool,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("IQ report truncated: {actual} bytes, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },
}

/// Whether a scan report's packet type allows opening a connection
pub fn is_connectable(packet_type: u8) -> bool {
    packet_type & NON_CONNECTABLE_MASK == 0
}

/// Search advertisement data for a 128-bit service UUID
///
/// Malformed length fields end the search rather than reading past `data`.
pub fn find_service_in_advertisement(data: &[u8], uuid: &[u8; 16]) -> bool {
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            break;
        }
        let Some(structure) = data.get(i + 1..i + 1 + len) else {
            break;
        };
        let ad_type = structure[0];
        if ad_type == AD_TYPE_INCOMPLETE_UUID128 || ad_type == AD_TYPE_COMPLETE_UUID128 {
            if structure[1..].chunks_exact(16).any(|chunk| chunk == uuid) {
                return true;
            }
        }
        i += len + 1;
    }
    false
}

/// Size of the fixed IQ report header preceding the samples
pub const IQ_REPORT_HEADER_LEN: usize = 18;

/// Decoded IQ report characteristic value
#[derive(Debug, Clone, PartialEq)]
pub struct IqReport {
    pub status: u16,
    pub locator_address: BdAddr,
    pub locator_address_type: AddressType,
    pub phy: u8,
    pub channel: u8,
    pub rssi: i8,
    pub rssi_antenna_id: u8,
    pub cte_type: u8,
    pub slot_durations: u8,
    pub packet_counter: u16,
    pub samples: Vec<i8>,
}

impl IqReport {
    /// Parse an IQ report
    ///
    /// # Layout (little-endian)
    ///
    /// ```text
    /// [0-1]   : Status (u16)
    /// [2-7]   : Locator address, least-significant byte first
    /// [8]     : Locator address type
    /// [9]     : PHY
    /// [10]    : Logical channel index
    /// [11]    : RSSI (i8, dBm)
    /// [12]    : RSSI antenna id
    /// [13]    : CTE type
    /// [14]    : Slot durations
    /// [15-16] : Packet counter (u16)
    /// [17]    : Sample count N
    /// [18..]  : N samples (i8), interleaved I,Q
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < IQ_REPORT_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: IQ_REPORT_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let count = bytes[17] as usize;
        let expected = IQ_REPORT_HEADER_LEN + count;
        let samples = bytes
            .get(IQ_REPORT_HEADER_LEN..expected)
            .ok_or(ProtocolError::Truncated {
                expected,
                actual: bytes.len(),
            })?;

        let locator_address = BdAddr::from_slice(&bytes[2..]).ok_or(ProtocolError::Truncated {
            expected: IQ_REPORT_HEADER_LEN,
            actual: bytes.len(),
        })?;

        Ok(Self {
            status: u16::from_le_bytes([bytes[0], bytes[1]]),
            locator_address,
            locator_address_type: AddressType::from(bytes[8]),
            phy: bytes[9],
            channel: bytes[10],
            rssi: bytes[11] as i8,
            rssi_antenna_id: bytes[12],
            cte_type: bytes[13],
            slot_durations: bytes[14],
            packet_counter: u16::from_le_bytes([bytes[15], bytes[16]]),
            samples: samples.iter().map(|b| *b as i8).collect(),
        })
    }

    pub fn capture(&self) -> IqCapture<'_> {
        IqCapture {
            samples: &self.samples,
            channel: self.channel,
            rssi: self.rssi,
            sequence: self.packet_counter,
        }
    }
}
