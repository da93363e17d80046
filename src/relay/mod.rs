//! Data Relay Module
//!
//! Role resolution, outbound dialing, and the two forwarding flows of a session.

pub mod copier;
pub mod dialer;
pub mod role;
pub mod session;

pub use copier::{PatternCopier, Rewrite};
pub use dialer::{Destinations, PeerDialer};
pub use role::{Role, RoleResolver};
pub use session::{CloseGate, RelayContext, RelaySession, SessionOutcome, SessionState};
