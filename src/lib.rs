//! PTCP: a reliable, ordered, connection-oriented byte-stream transport
//! multiplexed over UDP.
//!
//! A single [`Multiplexer`] owns one datagram socket and demultiplexes it
//! into many independent connections, each identified by a pair of 16-bit
//! pseudo-ports plus the peer's UDP address, the same relationship a TCP
//! port has to an IP address, one layer further up. PTCP gives those
//! connections TCP's reliability and ordering guarantees (retransmission,
//! cumulative ACKs, in-order delivery) without requiring a real TCP/IP
//! stack underneath.
//!
//! # Organization
//!
//! - [`packet`] is the wire codec.
//! - [`seq`] is sequence-space arithmetic: modular comparisons and the
//!   RFC 793 segment/ACK acceptability tests.
//! - [`state`] is the protocol state machine.
//! - [`connection`] is the per-connection engine built on top of those
//!   three: inbound and outbound paths, and the transport handle an
//!   application protocol is given.
//! - [`multiplexer`] ties everything to a real socket and scheduler.
//! - [`application`] defines the traits an application implements
//!   ([`application::PtcpProtocol`]) and is given
//!   ([`application::PtcpTransport`]).
//! - [`transport`] and [`timer`] are the injectable datagram-socket and
//!   scheduler collaborators the multiplexer is built from.
//! - [`message`] is the zero-copy byte buffer used throughout for payloads.

pub mod address;
pub mod application;
pub mod config;
pub mod connection;
pub mod error;
pub mod isn;
pub mod message;
pub mod multiplexer;
pub mod packet;
pub mod seq;
pub mod state;
pub mod timer;
pub mod transport;

pub use address::{ConnectionKey, PtcpAddress};
pub use config::Config;
pub use connection::Connection;
pub use message::Message;
pub use multiplexer::Multiplexer;
pub use packet::{Flags, Packet};
pub use state::State;
