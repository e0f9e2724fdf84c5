use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("invalid transaction id length {0}")]
    InvalidTransactionId(usize),

    #[error("address {0} is already bound")]
    AddressInUse(SocketAddr),

    #[error("address family of {0} is disabled")]
    FamilyDisabled(SocketAddr),

    #[error("no local address found for {0} autoroute")]
    NoRoute(&'static str),

    #[error("no endpoint can reach {0}")]
    NoEndpoint(SocketAddr),

    #[error("send queue full, dropped datagram to {0}")]
    QueueFull(SocketAddr),

    #[error("dht has no bound endpoints")]
    NotBound,

    #[error("dht has been shut down")]
    Stopped,
}
