//! IRC bridge: maps external channels onto rooms.

pub mod client;
pub mod codec;
pub mod color;
pub mod commands;
pub mod governor;
pub mod manager;
pub mod protocol;
pub mod session;

pub use governor::AdmissionGovernor;
pub use manager::{IrcBridgeManager, IrcConfig};
