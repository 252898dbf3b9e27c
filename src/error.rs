//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadex crate error enum.
pub enum Error {
    /// Indicates that an [crate::Id] could not be built from the given bytes.
    #[error("Invalid Id size {0}, expected 20 bytes")]
    InvalidIdSize(usize),

    /// Indicates that an [crate::Id] could not be parsed from a hex string.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Errors related to parsing DHT messages.
    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A contact address on the wire could not be parsed.
    #[error("Invalid contact address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    /// The underlying datagram transport failed.
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    /// A store operation failed on every attempted node.
    Store(#[from] crate::rpc::StoreError),

    /// A pinged node did not respond in time.
    #[error("No response from the pinged node")]
    NoResponse,

    /// The [crate::Dht] actor thread is no longer running.
    #[error("Dht actor thread is shut down")]
    Shutdown,
}
