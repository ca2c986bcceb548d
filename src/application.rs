//! The application-facing interface: the trait an application implements to
//! sit on top of a PTCP connection (the external "application protocol"
//! collaborator), the handle it's given to talk back to that connection,
//! and the factory traits a [`crate::multiplexer::Multiplexer`] uses to
//! hand out new protocol instances.

use crate::{address::PtcpAddress, error::SendError, message::Message};
use async_trait::async_trait;
use std::sync::Arc;

/// The transport-facing handle an application protocol is given at
/// `make_connection` time, and keeps for the life of the connection.
/// Mirrors the reference implementation's `ITransport`: `write`,
/// `write_sequence`, `lose_connection`, the endpoint addresses, and the
/// producer/consumer flow-control registration methods.
#[async_trait]
pub trait PtcpTransport: Send + Sync {
    /// Queue bytes for sending. Never blocks; queued data is coalesced and
    /// sent according to the connection's send-delay timer.
    async fn write(&self, data: Message) -> Result<(), SendError>;

    /// Convenience for writing several chunks as if concatenated into one
    /// `write` call.
    async fn write_sequence(&self, chunks: Vec<Message>) -> Result<(), SendError> {
        let mut combined = Message::new(Vec::new());
        for chunk in chunks {
            combined.concatenate(chunk);
        }
        self.write(combined).await
    }

    /// Begin an orderly shutdown: send any queued data, then FIN.
    async fn lose_connection(&self);

    fn host(&self) -> PtcpAddress;
    fn peer(&self) -> PtcpAddress;

    /// Register a producer that will be told to pause/resume as the send
    /// buffer fills and drains. Most application protocols don't need this.
    fn register_producer(&self, _producer: Arc<dyn Producer>, _streaming: bool) {}
    fn unregister_producer(&self) {}

    /// Stop delivering inbound data; arriving segments are dropped rather
    /// than buffered until `resume_producing`.
    fn pause_producing(&self) {}
    fn resume_producing(&self) {}
}

/// The other half of flow control: something driving writes that can be
/// told to slow down or stop when the connection's buffer is full.
pub trait Producer: Send + Sync {
    fn pause_producing(&self);
    fn resume_producing(&self);
    fn stop_producing(&self) {}
}

/// The application protocol itself: `make_connection`/`data_received`/
/// `connection_lost`, plus the optional consumer-side methods a streaming
/// producer above it can call. Default bodies are no-ops, since most
/// application protocols only care about `data_received`.
#[async_trait]
pub trait PtcpProtocol: Send {
    async fn make_connection(&mut self, transport: Arc<dyn PtcpTransport>);
    async fn data_received(&mut self, data: Message);
    async fn connection_lost(&mut self, reason: Option<String>);

    /// Called when this protocol is itself acting as a consumer of a
    /// producer registered on its transport (rare; only relevant to
    /// protocols relaying another producer's output over PTCP).
    fn pause_producing(&mut self) {}
    fn resume_producing(&mut self) {}
    fn stop_producing(&mut self) {}
}

/// Builds a [`PtcpProtocol`] for each inbound connection accepted on a
/// listening pseudo-port, mirroring `IProtocolFactory.buildProtocol`. Held
/// as a shared `Arc` across every accepted connection, so this one needs
/// `Sync`; the protocols it builds don't.
pub trait ServerFactory: Send + Sync {
    fn build_protocol(&self, peer: PtcpAddress) -> Box<dyn PtcpProtocol>;
}

/// Notified when an outbound `connect` never reaches `Established`,
/// mirroring `IClientFactory.clientConnectionFailed`.
pub trait ClientFactory: Send {
    fn client_connection_failed(&mut self, reason: crate::error::ConnectError);
}
