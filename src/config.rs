//! Tunables the reference implementation hard-codes as module-level
//! constants. Collected here so a caller can adjust them without forking the
//! crate; [`Config::default`] matches the reference implementation's values
//! except where noted.

use std::time::Duration;

/// Crate-wide tunables for a [`crate::multiplexer::Multiplexer`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Starting MTU for new connections, in bytes, header included.
    pub initial_mtu: usize,
    /// The receive window advertised while a connection's buffer has room.
    pub receive_window: u16,
    /// How long to coalesce successive small writes before flushing
    /// (Nagle-lite send-delay).
    pub send_delay: Duration,
    /// How long to hold an ACK before sending it standalone, hoping to
    /// piggyback it on an outgoing data segment instead.
    pub ack_delay: Duration,
    /// How long to wait before retransmitting an unacknowledged segment.
    pub retransmit_interval: Duration,
    /// How many times to retransmit a segment before giving up and
    /// resetting the connection.
    pub max_retransmits: u32,
    /// How long to remain in `TimeWait` before deleting the connection.
    pub time_wait: Duration,
    /// How long to wait, after the peer's FIN leaves us in `CloseWait`,
    /// before automatically closing our half if the application hasn't.
    pub half_close_delay: Duration,
    /// The pseudo-port new passive-open listeners and synthesized
    /// connections use as their rendezvous point.
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_mtu: 512 - crate::packet::HEADER_LEN,
            receive_window: 4096,
            send_delay: Duration::from_micros(10),
            ack_delay: Duration::from_millis(100),
            retransmit_interval: Duration::from_millis(500),
            max_retransmits: 50,
            time_wait: Duration::from_secs(60),
            half_close_delay: Duration::from_millis(10),
            listen_port: 1,
        }
    }
}
