//! An in-process network double, for driving a cluster of [`crate::Peer`]s
//! under test without a real transport.

pub mod network;

pub use network::{Network, NetworkClient};
