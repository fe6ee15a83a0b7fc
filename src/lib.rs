//! ferricd - Ferric IRC Daemon
//!
//! A TS6-mesh IRC server core: connection lifecycle and registration
//! gating, the address-indexed access-control engine, and server link
//! management with full-state burst synchronization.
//!
//! Built as a library plus a thin binary so tests can stand up
//! independent daemons in one process.

pub mod bans;
pub mod class;
pub mod config;
pub mod error;
pub mod hostmask;
pub mod network;
pub mod state;
pub mod sync;
pub mod tasks;

pub use config::Config;
pub use state::Nexus;
