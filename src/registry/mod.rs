//! Live connection tracking and message delivery

pub mod connection;

pub use connection::{ConnectionEntry, ConnectionRegistry, DroppedConnection};
