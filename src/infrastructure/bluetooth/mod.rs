//! Bluetooth Module
//!
//! Drives the BLE radio through the gateway's event/command vocabulary.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      GatewayService                      │
//! │   (owns every registry, dispatches radio events)         │
//! └──────┬──────────────┬──────────────┬─────────────┬───────┘
//!        │              │              │             │
//!        ▼              ▼              ▼             ▼
//! ┌────────────┐ ┌─────────────┐ ┌────────────┐ ┌──────────────┐
//! │  Scanner   │ │  Registry   │ │ Connection │ │ TagAggregator│
//! │            │ │             │ │            │ │              │
//! │ - allow    │ │ - bounded   │ │ - GATT FSM │ │ - quorum     │
//! │   list     │ │ - compacts  │ │ - locator  │ │ - position   │
//! │ - AD parse │ │   on remove │ │   sessions │ │   fixes      │
//! └────────────┘ └─────────────┘ └────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Radio events, commands, UUIDs and IQ report parsing
//! - [`scanner`] - Scan report filtering
//! - [`connection`] - Per-link discovery state machine
//! - [`registry`] - Bounded connection table
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;

// Re-export main service for convenience
pub use service::{GatewayConfig, GatewayError, GatewayService};
