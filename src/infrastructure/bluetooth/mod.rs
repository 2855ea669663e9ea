//! Bluetooth Bridge Module
//!
//! Links the host BLE API to the out-of-process BLE server over a byte
//! stream of length-prefixed JSON frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     BluetoothBridge                       │
//! │  (Public facade - commands in, BridgeEvents out)          │
//! └──────────────┬─────────────────┬─────────────────┬───────┘
//!                │                 │                 │
//!                ▼                 ▼                 ▼
//!        ┌─────────────┐  ┌───────────────┐  ┌───────────────┐
//!        │ Correlator  │  │ DeviceTable   │  │ Subscription  │
//!        │             │  │               │  │ Registry      │
//!        │ - ids       │  │ - address →   │  │ - sub id →    │
//!        │ - pending   │  │   handle      │  │   (addr, svc, │
//!        │   requests  │  │               │  │    char)      │
//!        └──────┬──────┘  └───────────────┘  └───────────────┘
//!               │
//!               ▼
//!        ┌─────────────┐  ┌───────────────┐
//!        │   Codec     │  │   Protocol    │
//!        │ - framing   │  │ - commands    │
//!        │             │  │ - messages    │
//!        │             │  │ - UUID form   │
//!        └─────────────┘  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Commands, inbound messages and UUID wire form
//! - [`codec`] - Length-prefixed JSON framing
//! - [`correlator`] - Request ids and pending responses
//! - [`devices`] - Address to device handle table
//! - [`subscriptions`] - Subscription id to characteristic routing
//! - [`service`] - Bridge facade and inbound dispatcher

pub mod codec;
pub mod correlator;
pub mod devices;
pub mod protocol;
pub mod service;
pub mod subscriptions;

// Re-export main service for convenience
pub use service::{BluetoothBridge, BridgeConfig};
