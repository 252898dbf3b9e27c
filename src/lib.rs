#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod config;
mod dht;
mod error;

pub mod routing;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use common::{
    Contact, ContactKind, Distance, Id, Message, MessageType, PeerInfo, RequestSpecific,
    ResponseSpecific, SenderInfo, ValueInfo, ValueTuple, VectorClock, ID_BITS, ID_SIZE, VERSION,
};
pub use config::Config;
pub use dht::{ChannelTransport, Dht, Testnet};
pub use error::Error;

/// Alias for the crate's [Error] enum.
pub type Result<T> = std::result::Result<T, Error>;

// Re-exports
pub use bytes::Bytes;
