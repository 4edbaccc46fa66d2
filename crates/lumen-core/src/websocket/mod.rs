//! WebSocket hubs
//!
//! - [`HubManager`] owns the named hubs and performs upgrades
//! - [`Hub`] is a broadcast domain with a single-writer coordinating loop
//! - [`Connection`] is one upgraded stream with its read and write pumps
//! - [`StreamContext`] is what a [`MessageHandler`] sees per inbound message

mod connection;
mod context;
mod hub;
mod manager;
mod message;

pub use connection::Connection;
pub use context::{stream_handler, MessageHandler, StreamContext};
pub use hub::{Hub, HubState};
pub use manager::HubManager;
pub use message::{is_upgrade_request, Message, MessageKind};
