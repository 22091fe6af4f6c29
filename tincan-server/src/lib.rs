//! TinCan chat server
//!
//! A single-threaded TCP chat server that:
//! - Admits connections into a fixed-size connection table
//! - Authenticates each against a static username allow-list
//! - Routes global broadcasts, direct messages and group messages
//! - Appends every routed message to a chat log and replays its tail on login

pub mod config;
pub mod directory;
pub mod handshake;
pub mod history;
pub mod metrics;
pub mod multiplexer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod slots;

pub use config::{ConfigError, ServerConfig};
pub use directory::{AllowList, Group, GroupTable};
pub use server::{Server, ShutdownHandle};
