use crate::control::SendOutcome;
use crate::message::MessageKind;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Failures that abort a measurement phase.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A selective wait gave up: the local acceptor died or the wait limit ran out.
    #[error("peer {peer} unavailable while waiting for '{awaiting}'")]
    PeerUnreachable { peer: IpAddr, awaiting: MessageKind },

    #[error("listener {listener} unreachable: {outcome}")]
    ListenerUnreachable { listener: IpAddr, outcome: SendOutcome },

    /// A chain hand-off could not be delivered.
    #[error("cannot reach peer {peer}: {outcome}")]
    PeerSend { peer: IpAddr, outcome: SendOutcome },

    #[error("unexpected reply from {peer} while waiting for '{awaiting}'")]
    UnexpectedReply { peer: IpAddr, awaiting: MessageKind },

    #[error("listener {listener} had no open flow for us")]
    MissingFlow { listener: IpAddr },

    #[error("unable to send the UDP stream: {0}")]
    Stream(#[from] io::Error),

    #[error("measurement cancelled")]
    Cancelled,

    #[error("round ended without a measurement")]
    EmptyRound,
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
