//! Line-oriented command shell over the bridge

use crate::domain::models::{BridgeEvent, CharacteristicRef};
use crate::infrastructure::bluetooth::BluetoothBridge;
use thiserror::Error;
use tracing::debug;

pub const HELP: &str = "\
Commands:
  scan | stop
  connect <addr>            disconnect <addr>
  services <addr>           chars <addr> <service>
  read <addr> <svc> <chr>
  write <addr> <svc> <chr> <hex> [noresp]
  notify <addr> <svc> <chr> on|off
  state | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Scan,
    StopScan,
    Connect(String),
    Disconnect(String),
    Services(String),
    Characteristics {
        address: String,
        service: String,
    },
    Read(CharacteristicRef),
    Write {
        target: CharacteristicRef,
        data: Vec<u8>,
        without_response: bool,
    },
    Notify {
        target: CharacteristicRef,
        enable: bool,
    },
    State,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("empty line")]
    Empty,
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid hex payload '{0}'")]
    InvalidHex(String),
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = words.split_first() else {
        return Err(ConsoleError::Empty);
    };

    let target = |usage: &'static str| -> Result<CharacteristicRef, ConsoleError> {
        match args {
            [address, service, characteristic, ..] => {
                Ok(CharacteristicRef::new(*address, *service, *characteristic))
            }
            _ => Err(ConsoleError::Usage(usage)),
        }
    };

    let command = match (name.to_lowercase().as_str(), args) {
        ("scan", []) => ConsoleCommand::Scan,
        ("stop", []) => ConsoleCommand::StopScan,
        ("connect", [address]) => ConsoleCommand::Connect(address.to_string()),
        ("connect", _) => return Err(ConsoleError::Usage("connect <addr>")),
        ("disconnect", [address]) => ConsoleCommand::Disconnect(address.to_string()),
        ("disconnect", _) => return Err(ConsoleError::Usage("disconnect <addr>")),
        ("services", [address]) => ConsoleCommand::Services(address.to_string()),
        ("services", _) => return Err(ConsoleError::Usage("services <addr>")),
        ("chars", [address, service]) => ConsoleCommand::Characteristics {
            address: address.to_string(),
            service: service.to_string(),
        },
        ("chars", _) => return Err(ConsoleError::Usage("chars <addr> <service>")),
        ("read", [_, _, _]) => ConsoleCommand::Read(target("read <addr> <svc> <chr>")?),
        ("read", _) => return Err(ConsoleError::Usage("read <addr> <svc> <chr>")),
        ("write", [_, _, _, hex]) | ("write", [_, _, _, hex, "noresp"]) => ConsoleCommand::Write {
            target: target("write <addr> <svc> <chr> <hex> [noresp]")?,
            data: parse_hex(hex)?,
            without_response: args.len() == 5,
        },
        ("write", _) => return Err(ConsoleError::Usage("write <addr> <svc> <chr> <hex> [noresp]")),
        ("notify", [_, _, _, "on"]) | ("notify", [_, _, _, "off"]) => ConsoleCommand::Notify {
            target: target("notify <addr> <svc> <chr> on|off")?,
            enable: args[3] == "on",
        },
        ("notify", _) => return Err(ConsoleError::Usage("notify <addr> <svc> <chr> on|off")),
        ("state", []) => ConsoleCommand::State,
        ("help", _) => ConsoleCommand::Help,
        ("quit", _) | ("exit", _) => ConsoleCommand::Quit,
        _ => return Err(ConsoleError::Unknown(name.to_string())),
    };
    Ok(command)
}

/// Parse `0a1bff` (optionally `0x`-prefixed) into bytes
fn parse_hex(text: &str) -> Result<Vec<u8>, ConsoleError> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if digits.is_empty() || digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(ConsoleError::InvalidHex(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ConsoleError::InvalidHex(text.to_string()))
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn outcome<T>(result: &Result<T, impl std::fmt::Display>, ok: impl FnOnce(&T) -> String) -> String {
    match result {
        Ok(value) => ok(value),
        Err(e) => format!("error: {}", e),
    }
}

/// One-line rendering of an event for the console
pub fn format_event(event: &BridgeEvent) -> String {
    match event {
        BridgeEvent::StateChange(state) => format!("stateChange {}", state),
        BridgeEvent::Discover(adv) => format!(
            "discover {} name={} rssi={} services=[{}]",
            adv.address,
            adv.local_name.as_deref().unwrap_or("-"),
            adv.rssi,
            adv.service_uuids.join(", ")
        ),
        BridgeEvent::Connect { address, error } => match error {
            None => format!("connect {} ok", address),
            Some(e) => format!("connect {} error: {}", address, e),
        },
        BridgeEvent::Disconnect { address, error } => match error {
            None => format!("disconnect {}", address),
            Some(e) => format!("disconnect {} error: {}", address, e),
        },
        BridgeEvent::ServicesDiscover { address, result } => format!(
            "services {} {}",
            address,
            outcome(result, |uuids| format!("[{}]", uuids.join(", ")))
        ),
        BridgeEvent::CharacteristicsDiscover {
            address,
            service,
            result,
        } => format!(
            "characteristics {} {} {}",
            address,
            service,
            outcome(result, |characteristics| {
                let items: Vec<String> = characteristics
                    .iter()
                    .map(|c| format!("{}({})", c.uuid, c.properties.join("|")))
                    .collect();
                format!("[{}]", items.join(", "))
            })
        ),
        BridgeEvent::Read {
            target,
            result,
            is_notification,
        } => format!(
            "{} {} {}",
            if *is_notification { "notification" } else { "read" },
            target,
            outcome(result, |bytes| hex(bytes))
        ),
        BridgeEvent::Write { target, error } => match error {
            None => format!("write {} ok", target),
            Some(e) => format!("write {} error: {}", target, e),
        },
        BridgeEvent::Notify { target, result } => format!(
            "notify {} {}",
            target,
            outcome(result, |enabled| if *enabled { "on" } else { "off" }.to_string())
        ),
    }
}

/// Run a bridge command. The outcome arrives as a [`BridgeEvent`].
pub async fn execute(bridge: &BluetoothBridge, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Scan => bridge.start_scanning(),
        ConsoleCommand::StopScan => bridge.stop_scanning(),
        ConsoleCommand::Connect(address) => bridge.connect(&address).await,
        ConsoleCommand::Disconnect(address) => bridge.disconnect(&address).await,
        ConsoleCommand::Services(address) => bridge.discover_services(&address).await.map(|_| ()),
        ConsoleCommand::Characteristics { address, service } => bridge
            .discover_characteristics(&address, &service)
            .await
            .map(|_| ()),
        ConsoleCommand::Read(t) => bridge
            .read(&t.address, &t.service, &t.characteristic)
            .await
            .map(|_| ()),
        ConsoleCommand::Write {
            target: t,
            data,
            without_response,
        } => {
            bridge
                .write(&t.address, &t.service, &t.characteristic, &data, without_response)
                .await
        }
        ConsoleCommand::Notify { target: t, enable } => bridge
            .notify(&t.address, &t.service, &t.characteristic, enable)
            .await
            .map(|_| ()),
        ConsoleCommand::State | ConsoleCommand::Help | ConsoleCommand::Quit => Ok(()),
    };
    if let Err(e) = result {
        debug!("Console command failed: {}", e);
    }
}
