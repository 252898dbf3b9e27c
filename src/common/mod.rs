//! Miscellaneous common value types used throughout the crate.

mod contact;
mod id;
mod messages;
mod value;

pub use contact::{Contact, ContactKind};
pub use id::{Distance, Id, ID_BITS, ID_SIZE};
pub use messages::{
    Message, MessageType, PeerInfo, RequestSpecific, ResponseSpecific, SenderInfo, ValueInfo,
    VERSION,
};
pub use value::{ValueTuple, VectorClock};
