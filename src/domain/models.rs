use crate::domain::error::BridgeError;
use std::fmt;

/// Adapter power state as seen by the host API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PoweredOn => "poweredOn",
            Self::PoweredOff => "poweredOff",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A characteristic as addressed by the host: device address plus
/// service and characteristic UUIDs in bare hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub address: String,
    pub service: String,
    pub characteristic: String,
}

impl CharacteristicRef {
    pub fn new(
        address: impl Into<String>,
        service: impl Into<String>,
        characteristic: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            service: service.into(),
            characteristic: characteristic.into(),
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service, self.characteristic)
    }
}

/// Advertisement received while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address with the colons stripped
    pub id: String,
    pub address: String,
    pub address_type: String,
    pub connectable: bool,
    pub local_name: Option<String>,
    pub tx_power_level: i32,
    pub service_uuids: Vec<String>,
    pub rssi: i32,
}

/// Discovered characteristic with the names of its enabled property flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: String,
    pub properties: Vec<String>,
}

/// Events emitted by the bridge towards the host API.
///
/// Every command outcome is reported here, success or failure, so a host
/// that only listens to events never misses a completion.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StateChange(PowerState),
    Discover(Advertisement),
    Connect {
        address: String,
        error: Option<BridgeError>,
    },
    /// Either the outcome of `disconnect` or a link loss reported by the
    /// BLE server, in which case `error` is `None`.
    Disconnect {
        address: String,
        error: Option<BridgeError>,
    },
    ServicesDiscover {
        address: String,
        result: Result<Vec<String>, BridgeError>,
    },
    CharacteristicsDiscover {
        address: String,
        service: String,
        result: Result<Vec<Characteristic>, BridgeError>,
    },
    /// Value of an explicit read, or of a push notification when
    /// `is_notification` is set.
    Read {
        target: CharacteristicRef,
        result: Result<Vec<u8>, BridgeError>,
        is_notification: bool,
    },
    Write {
        target: CharacteristicRef,
        error: Option<BridgeError>,
    },
    Notify {
        target: CharacteristicRef,
        result: Result<bool, BridgeError>,
    },
}
