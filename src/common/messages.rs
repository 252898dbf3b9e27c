//! Typed DHT messages and their wire representation.
//!
//! The core only touches the typed [Message]; the bencode layout lives in
//! [internal] and can be swapped for another codec without touching handlers.

mod internal;

use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;

use crate::common::{Contact, ContactKind, Id, ValueTuple, VectorClock};
use crate::storage::Condition;
use crate::{Error, Result};

use internal::{
    WireClockEntry, WireMessage, WireMessageVariant, WirePeer, WireRequestSpecific,
    WireResponseSpecific, WireSender, WireValue,
};

/// Protocol version carried by every message. "KX" version 01.
pub const VERSION: [u8; 4] = [75, 88, 0, 1];

#[derive(Debug, Clone, PartialEq)]
/// The sender contact carried by every message: identifier, instance id,
/// visibility flag and claimed address.
pub struct SenderInfo {
    pub id: Id,
    pub instance_id: u32,
    pub address: SocketAddr,
    /// Nodes that can not accept inbound traffic set this to `false` and are
    /// never added to routing tables.
    pub visible: bool,
}

impl SenderInfo {
    pub fn from_contact(contact: &Contact) -> SenderInfo {
        SenderInfo {
            id: *contact.id(),
            instance_id: contact.instance_id(),
            address: contact.address(),
            visible: true,
        }
    }

    /// The sighting this sender represents, observed at `from`.
    ///
    /// The observed source address wins over the claimed one.
    pub fn contact(&self, kind: ContactKind, from: SocketAddr) -> Contact {
        Contact::new(kind, self.id, self.instance_id, from)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A contact-list entry on the wire.
pub struct PeerInfo {
    pub id: Id,
    pub instance_id: u32,
    pub address: SocketAddr,
}

impl PeerInfo {
    pub fn from_contact(contact: &Contact) -> PeerInfo {
        PeerInfo {
            id: *contact.id(),
            instance_id: contact.instance_id(),
            address: contact.address(),
        }
    }

    /// Contacts learned from a response's contact list start out [ContactKind::Unknown].
    pub fn contact(&self) -> Contact {
        Contact::unknown(self.id, self.instance_id, self.address)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A [ValueTuple] on the wire; the sender is the enclosing message's sender.
pub struct ValueInfo {
    pub key: Id,
    pub value: Bytes,
    pub creator: PeerInfo,
    pub clock: VectorClock,
}

impl ValueInfo {
    pub fn from_tuple(tuple: &ValueTuple) -> ValueInfo {
        ValueInfo {
            key: *tuple.key(),
            value: tuple.value().clone(),
            creator: PeerInfo::from_contact(tuple.creator()),
            clock: tuple.clock().clone(),
        }
    }

    pub fn into_tuple(self, sender: Contact) -> ValueTuple {
        ValueTuple::received(self.creator.contact(), sender, self.key, self.value, self.clock)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpecific {
    Ping,
    FindNode { target: Id },
    FindValue { key: Id },
    Store { value: ValueInfo },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSpecific {
    Ping,
    FindNode {
        contacts: Vec<PeerInfo>,
    },
    /// The value if the responder holds it, else its closest contacts to the key.
    FindValue {
        value: Option<ValueInfo>,
        contacts: Vec<PeerInfo>,
    },
    Store {
        condition: Condition,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: u64,
    pub version: Option<[u8; 4]>,
    pub sender: SenderInfo,
    pub message_type: MessageType,
}

impl Message {
    pub fn request(transaction_id: u64, sender: SenderInfo, request: RequestSpecific) -> Message {
        Message {
            transaction_id,
            version: Some(VERSION),
            sender,
            message_type: MessageType::Request(request),
        }
    }

    pub fn response(
        transaction_id: u64,
        sender: SenderInfo,
        response: ResponseSpecific,
    ) -> Message {
        Message {
            transaction_id,
            version: Some(VERSION),
            sender,
            message_type: MessageType::Response(response),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        Message::from_wire(WireMessage::from_bytes(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_wire().to_bytes()?)
    }

    // === Private Methods ===

    fn to_wire(&self) -> WireMessage {
        let variant = match &self.message_type {
            MessageType::Request(request) => WireMessageVariant::Request(match request {
                RequestSpecific::Ping => WireRequestSpecific::Ping,
                RequestSpecific::FindNode { target } => WireRequestSpecific::FindNode {
                    target: *target.as_bytes(),
                },
                RequestSpecific::FindValue { key } => WireRequestSpecific::FindValue {
                    key: *key.as_bytes(),
                },
                RequestSpecific::Store { value } => WireRequestSpecific::Store {
                    value: encode_value(value),
                },
            }),
            MessageType::Response(response) => WireMessageVariant::Response(match response {
                ResponseSpecific::Ping => WireResponseSpecific::Ping,
                ResponseSpecific::FindNode { contacts } => WireResponseSpecific::FindNode {
                    contacts: contacts.iter().map(encode_peer).collect(),
                },
                ResponseSpecific::FindValue { value, contacts } => {
                    WireResponseSpecific::FindValue {
                        value: value.as_ref().map(encode_value),
                        contacts: contacts.iter().map(encode_peer).collect(),
                    }
                }
                ResponseSpecific::Store { condition } => WireResponseSpecific::Store {
                    stored: condition.is_success() as u8,
                },
            }),
        };

        WireMessage {
            transaction_id: self.transaction_id.to_be_bytes(),
            version: self.version,
            sender: WireSender {
                id: *self.sender.id.as_bytes(),
                instance_id: self.sender.instance_id,
                address: encode_address(&self.sender.address),
                visible: self.sender.visible as u8,
            },
            variant,
        }
    }

    fn from_wire(wire: WireMessage) -> Result<Message> {
        let message_type = match wire.variant {
            WireMessageVariant::Request(request) => MessageType::Request(match request {
                WireRequestSpecific::Ping => RequestSpecific::Ping,
                WireRequestSpecific::FindNode { target } => RequestSpecific::FindNode {
                    target: Id::from(target),
                },
                WireRequestSpecific::FindValue { key } => RequestSpecific::FindValue {
                    key: Id::from(key),
                },
                WireRequestSpecific::Store { value } => RequestSpecific::Store {
                    value: decode_value(value)?,
                },
            }),
            WireMessageVariant::Response(response) => MessageType::Response(match response {
                WireResponseSpecific::Ping => ResponseSpecific::Ping,
                WireResponseSpecific::FindNode { contacts } => ResponseSpecific::FindNode {
                    contacts: decode_peers(contacts)?,
                },
                WireResponseSpecific::FindValue { value, contacts } => {
                    ResponseSpecific::FindValue {
                        value: value.map(decode_value).transpose()?,
                        contacts: decode_peers(contacts)?,
                    }
                }
                WireResponseSpecific::Store { stored } => ResponseSpecific::Store {
                    condition: if stored != 0 {
                        Condition::Success
                    } else {
                        Condition::Failure
                    },
                },
            }),
        };

        Ok(Message {
            transaction_id: u64::from_be_bytes(wire.transaction_id),
            version: wire.version,
            sender: SenderInfo {
                id: Id::from(wire.sender.id),
                instance_id: wire.sender.instance_id,
                address: decode_address(&wire.sender.address)?,
                visible: wire.sender.visible != 0,
            },
            message_type,
        })
    }
}

fn encode_address(address: &SocketAddr) -> Vec<u8> {
    address.to_string().into_bytes()
}

fn decode_address(bytes: &[u8]) -> Result<SocketAddr> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::InvalidAddress(format!("{:x?}", bytes)))?;

    SocketAddr::from_str(text).map_err(|_| Error::InvalidAddress(text.into()))
}

fn encode_peer(peer: &PeerInfo) -> WirePeer {
    WirePeer {
        id: *peer.id.as_bytes(),
        instance_id: peer.instance_id,
        address: encode_address(&peer.address),
    }
}

fn decode_peer(peer: WirePeer) -> Result<PeerInfo> {
    Ok(PeerInfo {
        id: Id::from(peer.id),
        instance_id: peer.instance_id,
        address: decode_address(&peer.address)?,
    })
}

fn decode_peers(peers: Vec<WirePeer>) -> Result<Vec<PeerInfo>> {
    peers.into_iter().map(decode_peer).collect()
}

fn encode_value(value: &ValueInfo) -> WireValue {
    WireValue {
        key: *value.key.as_bytes(),
        value: value.value.to_vec(),
        creator: encode_peer(&value.creator),
        clock: value
            .clock
            .iter()
            .map(|(writer, counter)| WireClockEntry {
                writer: *writer.as_bytes(),
                counter: *counter,
            })
            .collect(),
    }
}

fn decode_value(value: WireValue) -> Result<ValueInfo> {
    Ok(ValueInfo {
        key: Id::from(value.key),
        value: value.value.into(),
        creator: decode_peer(value.creator)?,
        clock: value
            .clock
            .into_iter()
            .map(|entry| (Id::from(entry.writer), entry.counter))
            .collect(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sender() -> SenderInfo {
        SenderInfo {
            id: Id::random(),
            instance_id: 3,
            address: SocketAddr::from(([127, 0, 0, 1], 6881)),
            visible: true,
        }
    }

    #[test]
    fn request_wire_round_trip() {
        let message = Message::request(
            0xdead_beef_0000_0001,
            sender(),
            RequestSpecific::FindNode {
                target: Id::random(),
            },
        );

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.version, Some(VERSION));
    }

    #[test]
    fn find_value_response_with_value() {
        let creator = Contact::random();
        let tuple = ValueTuple::new(creator, Id::random(), Bytes::from("hello"));

        let message = Message::response(
            7,
            sender(),
            ResponseSpecific::FindValue {
                value: Some(ValueInfo::from_tuple(&tuple)),
                contacts: vec![],
            },
        );

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        match decoded.message_type {
            MessageType::Response(ResponseSpecific::FindValue { value: Some(value), .. }) => {
                assert_eq!(value.key, *tuple.key());
                assert_eq!(value.value, *tuple.value());
                assert_eq!(value.clock, *tuple.clock());
            }
            other => panic!("unexpected message type: {:?}", other),
        }
    }

    #[test]
    fn find_value_fallback_carries_contacts() {
        let contacts: Vec<PeerInfo> = (0..3)
            .map(|_| PeerInfo::from_contact(&Contact::random()))
            .collect();

        let message = Message::response(
            9,
            sender(),
            ResponseSpecific::FindValue {
                value: None,
                contacts: contacts.clone(),
            },
        );

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        match decoded.message_type {
            MessageType::Response(ResponseSpecific::FindValue { value, contacts: decoded }) => {
                assert!(value.is_none());
                assert_eq!(decoded, contacts);
            }
            other => panic!("unexpected message type: {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Message::from_bytes(b"not bencode at all").is_err());
    }
}
