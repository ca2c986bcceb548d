//! Typed error surface for packet decoding, connection setup, and sends.
//!
//! Nothing here crosses into application code as a `Result`: per the error
//! handling design, failures the application can observe arrive only through
//! [`crate::application::PtcpProtocol::connection_lost`] or
//! [`crate::application::ClientFactory::client_connection_failed`]. These
//! types exist for the layers below that boundary, and for `tracing` to log.

use thiserror::Error;

/// Failures decoding a datagram as a PTCP packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The whole datagram is shorter than the fixed header; there's no
    /// header to even read `dlen` out of. Dropped silently, not advised.
    #[error("datagram of {len} bytes is shorter than the {header_len}-byte header")]
    HeaderTooShort { len: usize, header_len: usize },

    /// The header declares a `dlen` longer than a packet may ever carry.
    #[error("declared payload of {len} bytes exceeds the maximum segment size of {max}")]
    TooLarge { len: usize, max: usize },

    /// Fewer payload bytes arrived than the header's `dlen` declared;
    /// triggers an STB advisory back to the sender.
    #[error("packet truncated: header declares {declared} bytes, only {actual} arrived")]
    Truncated { declared: usize, actual: usize },

    /// More payload bytes arrived than the header's `dlen` declared.
    #[error("packet carries {actual} bytes of garbage past the declared {declared}")]
    Garbage { declared: usize, actual: usize },

    /// The CRC-32 trailer did not match the computed checksum.
    #[error("checksum mismatch: header says {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Failures in interpreting an otherwise well-formed packet against a
/// connection's protocol state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A SYN segment carried a data payload, which PTCP never permits.
    #[error("SYN segment carried {0} bytes of payload")]
    SynWithData(usize),

    /// A non-SYN packet named a pseudo-port pair the multiplexer has no
    /// connection or listener for.
    #[error("no connection or listener for pseudo-port {local}, peer {peer}")]
    UnknownConnection { local: u16, peer: u16 },

    /// A packet referenced an ISN that conflicts with the one already
    /// recorded for this connection.
    #[error("peer ISN mismatch: connection has {recorded}, packet claims {offered}")]
    IsnMismatch { recorded: u32, offered: u32 },

    /// The peer sent an RST, tearing the connection down unconditionally.
    #[error("connection reset by peer (pseudo-port {local}, peer {peer})")]
    ResetByPeer { local: u16, peer: u16 },

    /// The retransmission retry budget was spent without an ACK covering
    /// the outstanding segments.
    #[error("timed out waiting for ack (pseudo-port {local}, peer {peer})")]
    Timeout { local: u16, peer: u16 },
}

/// Failures that can prevent a connection from ever reaching `Established`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection reset by peer before the handshake completed")]
    Reset,

    #[error("no listener registered for pseudo-port {0}")]
    NoListener(u16),

    #[error("connection attempt timed out")]
    TimedOut,
}

/// Failures writing to an established connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is not in a state that accepts writes")]
    NotConnected,

    #[error("write buffer producer is registered and paused")]
    Paused,
}
