use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a Bluetooth device address in bytes
pub const ADDRESS_LEN: usize = 6;

/// Bluetooth device address, stored least-significant byte first as the radio reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; ADDRESS_LEN]);

impl BdAddr {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let addr: [u8; ADDRESS_LEN] = bytes.get(..ADDRESS_LEN)?.try_into().ok()?;
        Some(Self(addr))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[5], a[4], a[3], a[2], a[1], a[0]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum AddressType {
    #[default]
    Public,
    StaticRandom,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        if value == 0 {
            Self::Public
        } else {
            Self::StaticRandom
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => 0,
            AddressType::StaticRandom => 1,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public device"),
            Self::StaticRandom => f.write_str("static random"),
        }
    }
}

/// Opaque identity of a tag or locator
///
/// Derived from the link-layer address as `ble-<pd|sr>-<address>`, with the
/// address printed most-significant byte first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_address(address: &BdAddr, address_type: AddressType) -> Self {
        let kind = match address_type {
            AddressType::Public => "pd",
            AddressType::StaticRandom => "sr",
        };
        let hex: String = address.0.iter().rev().map(|b| format!("{:02X}", b)).collect();
        Self(format!("ble-{}-{}", kind, hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Point in the site coordinate system, in meters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Rotation of a locator's antenna array around each site axis, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One angle measurement of a tag as seen from one locator
#[derive(Debug, Clone, PartialEq)]
pub struct AngleObservation {
    pub tag_id: DeviceId,
    pub locator_id: DeviceId,
    pub azimuth: f32,
    pub elevation: f32,
    /// Smoothed RSSI-derived distance in meters
    pub distance: f32,
    pub rssi: i16,
    pub channel: u16,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Smoothed position fix for one tag
#[derive(Debug, Clone, PartialEq)]
pub struct PositionResult {
    pub tag_id: DeviceId,
    pub position: Position,
}
