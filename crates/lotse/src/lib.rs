//! # lotse
//!
//! Persistent port-forwarding manager for containerized workloads.
//!
//! Lotse records host-to-container port mappings per container, keeps the
//! mapping table durable across restarts, and programs the forwarding rules
//! that realize each mapping. Adding mappings is all-or-nothing; removing
//! them is best-effort with full reporting.

#![warn(missing_docs)]

pub mod manager;
pub mod mapping;
pub mod reserve;
pub mod rules;
pub mod store;

pub use manager::PortManager;
pub use mapping::{MappingRecord, PortKey, PortMapping, Protocol, parse_host_address};
pub use reserve::ReservationTable;
pub use rules::{IptablesInstaller, RuleHandle, RuleInstaller};
pub use store::MappingStore;
