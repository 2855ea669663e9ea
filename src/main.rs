use anyhow::Result;
use ble_bridge::domain::models::{BridgeEvent, PowerState};
use ble_bridge::domain::settings::SettingsService;
use ble_bridge::infrastructure::bluetooth::{BluetoothBridge, BridgeConfig};
use ble_bridge::infrastructure::logging::init_logger;
use ble_bridge::infrastructure::transport::Transport;
use ble_bridge::presentation::console::{self, ConsoleCommand, ConsoleError, HELP};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit settings file may be given as the only argument
    let settings_service = match std::env::args().nth(1) {
        Some(path) => SettingsService::from_path(PathBuf::from(path)),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting BLE bridge (settings: {})",
        settings_service.path().display()
    );
    // Leave an editable settings file behind on first run
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Failed to write default settings: {}", e);
        }
    }

    let (transport, reader, writer) = Transport::open(&settings.server).await?;
    let (bridge, mut events) =
        BluetoothBridge::start(reader, writer, BridgeConfig::from(&settings.bridge));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                match console::parse_command(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(ConsoleCommand::Help) => println!("{}", HELP),
                    Ok(ConsoleCommand::State) => println!(
                        "state {} ({} connected, {} subscriptions)",
                        bridge.state(),
                        bridge.connected_count(),
                        bridge.subscription_count()
                    ),
                    Ok(command) => {
                        let bridge = bridge.clone();
                        tokio::spawn(async move { console::execute(&bridge, command).await });
                    }
                    Err(ConsoleError::Empty) => {}
                    Err(e) => println!("{}", e),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", console::format_event(&event));
                if matches!(event, BridgeEvent::StateChange(PowerState::PoweredOff)) {
                    info!("BLE server link is down, exiting");
                    break;
                }
            }
        }
    }

    bridge.close();
    transport.shutdown().await?;
    info!("BLE bridge stopped");
    Ok(())
}
