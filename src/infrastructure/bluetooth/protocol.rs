//! BLE Server Protocol
//!
//! This module contains the message definitions exchanged with the BLE
//! server process: outbound commands, inbound messages and the UUID wire
//! form.

use crate::domain::error::BridgeError;
use crate::domain::models::{Advertisement, Characteristic};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Discriminator of inbound messages
pub const TYPE_FIELD: &str = "_type";

/// Correlation id of requests and responses
pub const ID_FIELD: &str = "_id";

/// Wrap a bare hyphenated UUID in braces, as the BLE server expects.
pub fn to_wire_uuid(uuid: &str) -> String {
    format!("{{{}}}", uuid)
}

/// Strip the braces from a UUID received from the BLE server.
pub fn from_wire_uuid(uuid: &str) -> String {
    uuid.replace(['{', '}'], "")
}

/// Opaque identifier assigned by the BLE server (device handles,
/// subscription ids). The server may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(id) => write!(f, "{}", id),
            Self::Signed(id) => write!(f, "{}", id),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<u64> for RemoteId {
    fn from(id: u64) -> Self {
        Self::Unsigned(id)
    }
}

/// Commands sent to the BLE server.
///
/// Service and characteristic UUIDs are carried in wire form. `device` is
/// `None` when the address has no known handle; the server rejects those.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Scan,
    StopScan,
    Connect {
        address: String,
    },
    Disconnect {
        device: Option<RemoteId>,
    },
    Services {
        device: Option<RemoteId>,
    },
    Characteristics {
        device: Option<RemoteId>,
        service: String,
    },
    Read {
        device: Option<RemoteId>,
        service: String,
        characteristic: String,
    },
    Write {
        device: Option<RemoteId>,
        service: String,
        characteristic: String,
        value: Vec<u8>,
        #[serde(rename = "withoutResponse", skip_serializing_if = "std::ops::Not::not")]
        without_response: bool,
    },
    Subscribe {
        device: Option<RemoteId>,
        service: String,
        characteristic: String,
    },
    Unsubscribe {
        device: Option<RemoteId>,
        service: String,
        characteristic: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::StopScan => "stopScan",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Services { .. } => "services",
            Self::Characteristics { .. } => "characteristics",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// JSON object for this command, tagged with a correlation id when one is given
    pub fn to_frame(&self, id: Option<u64>) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let (Some(id), Value::Object(map)) = (id, &mut value) {
            map.insert(ID_FIELD.to_string(), Value::from(id));
        }
        Ok(value)
    }
}

/// Advertisement reported while scanning
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub bluetooth_address: String,
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
    #[serde(default)]
    pub rssi: i32,
}

impl ScanResult {
    pub fn into_advertisement(self) -> Advertisement {
        Advertisement {
            id: self.bluetooth_address.replace(':', ""),
            address: self.bluetooth_address,
            address_type: "public".to_string(),
            connectable: true,
            local_name: self.local_name,
            tx_power_level: 0,
            service_uuids: self
                .service_uuids
                .iter()
                .map(|uuid| from_wire_uuid(uuid))
                .collect(),
            rssi: self.rssi,
        }
    }
}

/// Answer to a correlated command
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(rename = "_id")]
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Response {
    /// Only a non-empty error marks a failed request; `null`, `false` and
    /// `""` are treated as absent.
    pub fn into_outcome(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(error) if is_truthy(&error) => Err(BridgeError::Remote(match error {
                Value::String(message) => message,
                other => other.to_string(),
            })),
            _ => Ok(self.result),
        }
    }
}

/// Link loss for a connected device, reported by handle
#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectEvent {
    pub device: RemoteId,
}

/// Value pushed for an active subscription
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChangedNotification {
    pub subscription_id: RemoteId,
    pub value: Vec<u8>,
}

/// Characteristic entry of a `characteristics` result
#[derive(Debug, Clone, Deserialize)]
pub struct WireCharacteristic {
    pub uuid: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl WireCharacteristic {
    pub fn into_characteristic(self) -> Characteristic {
        Characteristic {
            uuid: from_wire_uuid(&self.uuid),
            properties: self
                .properties
                .into_iter()
                .filter(|(_, enabled)| is_truthy(enabled))
                .map(|(name, _)| name)
                .collect(),
        }
    }
}

/// Inbound message, classified by its `_type`
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Start,
    ScanResult(ScanResult),
    Response(Response),
    DisconnectEvent(DisconnectEvent),
    ValueChanged(ValueChangedNotification),
    /// Kinds this bridge doesn't know about; ignored
    Unknown(String),
}

impl InboundMessage {
    /// Classify a decoded frame.
    ///
    /// A missing discriminator or a known kind with a malformed body is a
    /// protocol error. Unknown kinds are not.
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        let kind = value
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol(format!("message without {}", TYPE_FIELD)))?
            .to_string();

        let message = match kind.as_str() {
            "Start" | "start" => Self::Start,
            "scanResult" => Self::ScanResult(parse_body(&kind, value)?),
            "response" => Self::Response(parse_body(&kind, value)?),
            "disconnectEvent" => Self::DisconnectEvent(parse_body(&kind, value)?),
            "valueChangedNotification" => Self::ValueChanged(parse_body(&kind, value)?),
            _ => Self::Unknown(kind),
        };
        Ok(message)
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, BridgeError> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::Protocol(format!("malformed {} message: {}", kind, e)))
}

/// JavaScript-style truthiness, which is how the BLE server's flags and
/// error fields are meant to be read
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEART_RATE: &str = "0000180d-0000-1000-8000-00805f9b34fb";

    #[test]
    fn test_uuid_round_trip() {
        let wire = to_wire_uuid(HEART_RATE);
        assert_eq!(wire, "{0000180d-0000-1000-8000-00805f9b34fb}");
        assert_eq!(from_wire_uuid(&wire), HEART_RATE);
        assert_eq!(to_wire_uuid(&from_wire_uuid(&wire)), wire);
    }

    #[test]
    fn test_command_frames() {
        let scan = Command::Scan.to_frame(None).unwrap();
        assert_eq!(scan, json!({ "cmd": "scan" }));

        let stop = Command::StopScan.to_frame(None).unwrap();
        assert_eq!(stop, json!({ "cmd": "stopScan" }));

        let read = Command::Read {
            device: Some("handle-1".into()),
            service: to_wire_uuid("180d"),
            characteristic: to_wire_uuid("2a37"),
        }
        .to_frame(Some(7))
        .unwrap();
        assert_eq!(
            read,
            json!({
                "cmd": "read",
                "device": "handle-1",
                "service": "{180d}",
                "characteristic": "{2a37}",
                "_id": 7
            })
        );
    }

    #[test]
    fn test_unknown_device_is_sent_as_null() {
        let frame = Command::Disconnect { device: None }.to_frame(Some(1)).unwrap();
        assert_eq!(frame["device"], Value::Null);
    }

    #[test]
    fn test_write_flag_only_when_set() {
        let mut write = Command::Write {
            device: Some(RemoteId::Unsigned(3)),
            service: "{180d}".to_string(),
            characteristic: "{2a39}".to_string(),
            value: vec![1, 255],
            without_response: false,
        };
        let frame = write.to_frame(Some(0)).unwrap();
        assert_eq!(frame["value"], json!([1, 255]));
        assert!(frame.get("withoutResponse").is_none());

        if let Command::Write {
            without_response, ..
        } = &mut write
        {
            *without_response = true;
        }
        let frame = write.to_frame(Some(0)).unwrap();
        assert_eq!(frame["withoutResponse"], json!(true));
    }

    #[test]
    fn test_classify_messages() {
        assert!(matches!(
            InboundMessage::from_value(json!({ "_type": "Start" })).unwrap(),
            InboundMessage::Start
        ));

        let response = InboundMessage::from_value(
            json!({ "_type": "response", "_id": 4, "result": [1, 2] }),
        )
        .unwrap();
        match response {
            InboundMessage::Response(r) => {
                assert_eq!(r.id, 4);
                assert_eq!(r.into_outcome().unwrap(), json!([1, 2]));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        match InboundMessage::from_value(json!({ "_type": "advertisementFilter" })).unwrap() {
            InboundMessage::Unknown(kind) => assert_eq!(kind, "advertisementFilter"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_missing_type_is_protocol_error() {
        let err = InboundMessage::from_value(json!({ "_id": 1 })).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        let err = InboundMessage::from_value(json!({ "_type": 12 })).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn test_out_of_range_byte_is_protocol_error() {
        let err = InboundMessage::from_value(json!({
            "_type": "valueChangedNotification",
            "subscriptionId": 1,
            "value": [256]
        }))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn test_response_error_truthiness() {
        let failed: Response =
            serde_json::from_value(json!({ "_id": 1, "error": "Device unreachable" })).unwrap();
        assert_eq!(
            failed.into_outcome(),
            Err(BridgeError::Remote("Device unreachable".to_string()))
        );

        let empty: Response =
            serde_json::from_value(json!({ "_id": 1, "error": "", "result": 5 })).unwrap();
        assert_eq!(empty.into_outcome(), Ok(json!(5)));
    }

    #[test]
    fn test_scan_result_to_advertisement() {
        let scan: ScanResult = serde_json::from_value(json!({
            "_type": "scanResult",
            "bluetoothAddress": "aa:bb:cc:dd:ee:ff",
            "localName": "HRM",
            "serviceUuids": ["{0000180d-0000-1000-8000-00805f9b34fb}"],
            "rssi": -61
        }))
        .unwrap();
        let adv = scan.into_advertisement();
        assert_eq!(adv.id, "aabbccddeeff");
        assert_eq!(adv.address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(adv.local_name.as_deref(), Some("HRM"));
        assert_eq!(adv.service_uuids, vec![HEART_RATE.to_string()]);
        assert_eq!(adv.rssi, -61);
        assert!(adv.connectable);
    }

    #[test]
    fn test_characteristic_properties() {
        let wire: WireCharacteristic = serde_json::from_value(json!({
            "uuid": "{00002a37-0000-1000-8000-00805f9b34fb}",
            "properties": { "notify": true, "read": true, "write": false, "indicate": 0 }
        }))
        .unwrap();
        let characteristic = wire.into_characteristic();
        assert_eq!(characteristic.uuid, "00002a37-0000-1000-8000-00805f9b34fb");
        assert_eq!(characteristic.properties, vec!["notify", "read"]);
    }

    #[test]
    fn test_remote_id_forms() {
        let text: RemoteId = serde_json::from_value(json!("sub-9")).unwrap();
        assert_eq!(text, RemoteId::Text("sub-9".to_string()));
        let number: RemoteId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(number, RemoteId::Unsigned(42));
        let negative: RemoteId = serde_json::from_value(json!(-1)).unwrap();
        assert_eq!(negative, RemoteId::Signed(-1));
        assert!(serde_json::from_value::<RemoteId>(Value::Null).is_err());
    }
}
