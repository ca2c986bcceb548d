//! The concrete [`crate::application::PtcpTransport`] an application
//! protocol is handed at `make_connection` time.
//!
//! A [`Connection`](super::Connection) lives inside the multiplexer's event
//! loop and is never touched from another task, so the handle an
//! application holds cannot reach it directly. Instead it holds a sender
//! for a small command enum, and the multiplexer's loop applies commands
//! the same way it applies inbound packets and fired timers: as another
//! kind of input to a `Connection` method, producing `Effects`.

use crate::{
    address::{ConnectionKey, PtcpAddress},
    application::{Producer, PtcpTransport},
    error::SendError,
    message::Message,
};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;

/// A command sent from a [`ConnectionHandle`] to the owning multiplexer,
/// tagged with which connection it targets. The multiplexer's event loop
/// polls one shared receiver for all connections rather than one receiver
/// per connection, since the set of connections changes as they open and
/// close.
#[derive(Debug)]
pub struct Command {
    pub key: ConnectionKey,
    pub body: CommandBody,
}

pub enum CommandBody {
    Write(Message),
    LoseConnection,
    RegisterProducer(Arc<dyn Producer>, bool),
    UnregisterProducer,
    PauseProducing,
    ResumeProducing,
}

impl fmt::Debug for CommandBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(data) => f.debug_tuple("Write").field(data).finish(),
            Self::LoseConnection => write!(f, "LoseConnection"),
            Self::RegisterProducer(_, streaming) => {
                f.debug_tuple("RegisterProducer").field(streaming).finish()
            }
            Self::UnregisterProducer => write!(f, "UnregisterProducer"),
            Self::PauseProducing => write!(f, "PauseProducing"),
            Self::ResumeProducing => write!(f, "ResumeProducing"),
        }
    }
}

/// The transport handle given to an application protocol.
pub struct ConnectionHandle {
    pub(crate) key: ConnectionKey,
    pub(crate) host: PtcpAddress,
    pub(crate) peer: PtcpAddress,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    fn send(&self, body: CommandBody) -> Result<(), SendError> {
        self.commands
            .send(Command { key: self.key, body })
            .map_err(|_| SendError::NotConnected)
    }
}

#[async_trait]
impl PtcpTransport for ConnectionHandle {
    async fn write(&self, data: Message) -> Result<(), SendError> {
        self.send(CommandBody::Write(data))
    }

    async fn lose_connection(&self) {
        let _ = self.send(CommandBody::LoseConnection);
    }

    fn host(&self) -> PtcpAddress {
        self.host
    }

    fn peer(&self) -> PtcpAddress {
        self.peer
    }

    fn register_producer(&self, producer: Arc<dyn Producer>, streaming: bool) {
        let _ = self.send(CommandBody::RegisterProducer(producer, streaming));
    }

    fn unregister_producer(&self) {
        let _ = self.send(CommandBody::UnregisterProducer);
    }

    fn pause_producing(&self) {
        let _ = self.send(CommandBody::PauseProducing);
    }

    fn resume_producing(&self) {
        let _ = self.send(CommandBody::ResumeProducing);
    }
}
