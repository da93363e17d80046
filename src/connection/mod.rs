//! Connection Management Module
//!
//! Accepts relay connections and tracks live sessions.

pub mod listener;

pub use listener::RelayListener;
