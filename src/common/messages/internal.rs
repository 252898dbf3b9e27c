use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: [u8; 8],

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<[u8; 4]>,

    #[serde(rename = "s")]
    pub sender: WireSender,

    #[serde(flatten)]
    pub variant: WireMessageVariant,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireSender {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(rename = "i")]
    pub instance_id: u32,

    /// `ip:port` as utf-8 bytes.
    #[serde(rename = "a", with = "serde_bytes")]
    pub address: Vec<u8>,

    #[serde(rename = "vis")]
    pub visible: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum WireMessageVariant {
    #[serde(rename = "q")]
    Request(WireRequestSpecific),

    #[serde(rename = "r")]
    Response(WireResponseSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum WireRequestSpecific {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(with = "serde_bytes")]
        target: [u8; 20],
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(with = "serde_bytes")]
        key: [u8; 20],
    },

    #[serde(rename = "store")]
    Store { value: WireValue },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "r")]
pub enum WireResponseSpecific {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "find_node")]
    FindNode { contacts: Vec<WirePeer> },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(default)]
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<WireValue>,

        #[serde(default)]
        contacts: Vec<WirePeer>,
    },

    #[serde(rename = "store")]
    Store { stored: u8 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePeer {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 20],

    #[serde(rename = "i")]
    pub instance_id: u32,

    #[serde(rename = "a", with = "serde_bytes")]
    pub address: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireValue {
    #[serde(with = "serde_bytes")]
    pub key: [u8; 20],

    #[serde(rename = "v", with = "serde_bytes")]
    pub value: Vec<u8>,

    pub creator: WirePeer,

    #[serde(default)]
    pub clock: Vec<WireClockEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireClockEntry {
    #[serde(with = "serde_bytes")]
    pub writer: [u8; 20],

    #[serde(rename = "c")]
    pub counter: u64,
}
