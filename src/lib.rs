//! Transit Library
//!
//! Single-port, two-way TCP relay. Connections from either of two known
//! peers arrive on the same port and are forwarded to the other peer;
//! downstream traffic is also mirrored to an optional third party, with its
//! `serverip='…'` field rewritten to the relay's own address.

pub mod config;
pub mod connection;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::RelayListener;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
