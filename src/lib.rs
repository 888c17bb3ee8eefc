//! # EPS Resilience Core
//!
//! Fault-tolerance core of a satellite Electrical Power System node: a
//! byte-level link layer over two redundant UART channels, a bounded fault
//! table with system-health reduction, per-component degradation tracking
//! with channel failover, and a ground query surface served over the same
//! framed protocol.
//!
//! ## Quick Start
//!
//! ```rust
//! use eps::config::EpsConfig;
//! use eps::subsystems::SimulatedSensors;
//! use eps::transport::MemoryPort;
//! use eps::EpsNode;
//!
//! let config = EpsConfig::default();
//! let sensors = SimulatedSensors::new(&config.rails);
//! let mut node = EpsNode::new(config, MemoryPort::new(), MemoryPort::new(), sensors).unwrap();
//!
//! node.run_ticks(100);
//! assert_eq!(node.redundancy().health(), eps::SystemHealth::Ok);
//! ```
//!
//! ## Architecture
//!
//! - [`ring`] - lock-free byte ring between the receive interrupt and the loop
//! - [`transport`] - serial port abstraction and the in-memory port
//! - [`packet`] - frame codec with CRC-16
//! - [`link`] - per-channel reassembly state machine
//! - [`bus`] - typed publish/subscribe event bus
//! - [`fault`] / [`redundancy`] - fault table and health engine
//! - [`failover`] - active channel selection
//! - [`command`] - ground command dispatcher and response encoding
//! - [`logging`] - flight log ring with downlink batching
//! - [`subsystems`] - rail, battery and MPPT producers plus power profiles
//! - [`node`] - main loop wiring

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]

pub mod bus;
pub mod command;
pub mod config;
pub mod failover;
pub mod fault;
pub mod link;
pub mod logging;
pub mod node;
pub mod packet;
pub mod redundancy;
pub mod ring;
pub mod subsystems;
pub mod transport;

pub use bus::{Event, EventBus, EventKind, EventQueue};
pub use config::EpsConfig;
pub use fault::{FaultSource, Severity, SystemHealth};
pub use node::EpsNode;
pub use packet::{MessageType, Packet};
pub use redundancy::{Component, RedundancyManager};
