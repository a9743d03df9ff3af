// === Wire format ===
pub mod wire;
pub mod error;

// === Command handlers ===
pub mod commands;

// === HTTP transport ===
pub mod server;
pub mod client;

// === Node assembly ===
pub mod node;

pub use client::{AdminClient, HttpParticipantProxy};
pub use commands::CommandSurface;
pub use error::WireError;
pub use node::{CoordinatorNode, NodeError};
