//! The multiplexer: the single task that owns one UDP socket and
//! demultiplexes it into many independent [`Connection`]s keyed by
//! `(local pseudo-port, peer pseudo-port, peer address)`.
//!
//! Everything funnels through one `tokio::select!` loop: inbound
//! datagrams, fired timers, and commands from [`ConnectionHandle`]s the
//! application is holding. That way a `Connection` is only ever touched
//! from this one task, satisfying spec.md §5's no-locks requirement without
//! needing a lock.

use crate::{
    address::{ConnectionKey, PtcpAddress},
    application::{ClientFactory, PtcpProtocol, ServerFactory},
    config::Config,
    connection::{
        handle::{Command, CommandBody, ConnectionHandle},
        Connection, Effects,
    },
    error::{ConnectError, PacketError},
    isn::IsnStrategy,
    message::Message,
    packet::{Flags, Packet},
    timer::{Scheduler, TimerFired, TimerHandle, TimerKind},
    transport::DatagramTransport,
};
use rustc_hash::FxHashMap;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, warn};

struct Entry {
    connection: Connection,
    protocol: Box<dyn PtcpProtocol>,
    client_factory: Option<Box<dyn ClientFactory>>,
}

/// Owns a datagram transport and scheduler, and every [`Connection`]
/// multiplexed over it.
pub struct Multiplexer {
    transport: Arc<dyn DatagramTransport>,
    scheduler: Arc<dyn Scheduler>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    connections: FxHashMap<ConnectionKey, Entry>,
    timers: FxHashMap<(ConnectionKey, TimerKind), TimerHandle>,
    listeners: FxHashMap<u16, Arc<dyn ServerFactory>>,
    isn: Box<dyn IsnStrategy>,
    config: Config,
    next_local_port: u16,
    all_closed: Arc<Notify>,
    /// Whether this multiplexer is still processing datagrams. Cleared by
    /// `stop_protocol`, either called directly or once the last connection
    /// closes on a multiplexer with no listeners registered.
    live: bool,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        scheduler: Arc<dyn Scheduler>,
        timer_rx: mpsc::UnboundedReceiver<TimerFired>,
        isn: Box<dyn IsnStrategy>,
        config: Config,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let next_local_port = config.listen_port.wrapping_add(1).max(2);
        Self {
            transport,
            scheduler,
            timer_rx,
            command_tx,
            command_rx,
            connections: FxHashMap::default(),
            timers: FxHashMap::default(),
            listeners: FxHashMap::default(),
            isn,
            config,
            next_local_port,
            all_closed: Arc::new(Notify::new()),
            live: true,
        }
    }

    /// Register a factory that builds a fresh protocol instance for every
    /// inbound connection accepted on `port`.
    pub fn listen(&mut self, port: u16, factory: Arc<dyn ServerFactory>) {
        self.listeners.insert(port, factory);
    }

    /// Allocates a fresh local pseudo-port. Mirrors the reference
    /// implementation's pseudo-port counter, which is ordinary mutable
    /// instance state on the multiplexer rather than anything shared.
    fn allocate_port(&mut self) -> u16 {
        loop {
            let port = self.next_local_port;
            self.next_local_port = self.next_local_port.wrapping_add(1).max(2);
            if !self
                .connections
                .keys()
                .any(|k| k.local_port == port)
            {
                return port;
            }
        }
    }

    /// Actively open a connection to `peer`. The resulting protocol's
    /// `make_connection` is called immediately with a transport handle;
    /// `client_factory` is told if the handshake never completes.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn connect(
        &mut self,
        peer: SocketAddr,
        peer_port: u16,
        mut protocol: Box<dyn PtcpProtocol>,
        client_factory: Box<dyn ClientFactory>,
    ) -> PtcpAddress {
        let local_port = self.allocate_port();
        let key = ConnectionKey::new(local_port, peer_port, peer);
        let iss = self.isn.generate();
        let (connection, syn) = Connection::open(key, iss, self.config.clone());

        let host = PtcpAddress::new(
            self.transport.local_addr().unwrap_or(peer),
            local_port,
        );
        let peer_addr = PtcpAddress::new(peer, peer_port);
        let handle = Arc::new(ConnectionHandle {
            key,
            host,
            peer: peer_addr,
            commands: self.command_tx.clone(),
        });
        protocol.make_connection(handle).await;

        self.connections.insert(
            key,
            Entry {
                connection,
                protocol,
                client_factory: Some(client_factory),
            },
        );
        self.send_packet(key, syn).await;
        host
    }

    async fn send_packet(&self, key: ConnectionKey, packet: Packet) {
        let bytes = packet.encode().to_vec();
        if let Err(error) = self.transport.send_to(&bytes, key.peer_addr).await {
            warn!(%error, %key, "failed to send packet");
        }
    }

    /// Reply to a truncated datagram with an STB advisory carrying the
    /// observed payload length, so the sender can shrink its MTU. The
    /// ports are swapped straight out of the bad datagram's own header,
    /// which `Packet::decode` validates before it can ever report
    /// `Truncated`, so the fixed header is always intact by that point.
    async fn send_shrink_advisory(&self, bytes: &[u8], peer: SocketAddr, observed_len: usize) {
        let source_port = u16::from_be_bytes([bytes[0], bytes[1]]);
        let dest_port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let advisory = Packet::new(
            dest_port,
            source_port,
            0,
            0,
            Flags::STB,
            0,
            Message::new((observed_len as u16).to_be_bytes().to_vec()),
        );
        let encoded = advisory.encode().to_vec();
        if let Err(error) = self.transport.send_to(&encoded, peer).await {
            warn!(%error, %peer, "failed to send mtu-shrink advisory");
        }
    }

    /// Runs forever, processing inbound datagrams, fired timers, and
    /// application commands as they arrive. Intended to be spawned as the
    /// multiplexer's single task.
    pub async fn run(&mut self) {
        let mut buf = vec![0u8; crate::packet::MAX_SEGMENT_SIZE + crate::packet::HEADER_LEN];
        while self.live {
            tokio::select! {
                result = self.transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.datagram_received(&buf[..len], peer).await,
                        Err(error) => {
                            warn!(%error, "datagram transport error, tearing down multiplexer");
                            self.stop_protocol().await;
                        }
                    }
                }
                Some(fired) = self.timer_rx.recv() => {
                    self.deliver_timer(fired).await;
                }
                Some(command) = self.command_rx.recv() => {
                    self.deliver_command(command).await;
                }
            }
        }
    }

    #[instrument(skip_all, fields(%peer))]
    async fn datagram_received(&mut self, bytes: &[u8], peer: SocketAddr) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(PacketError::Truncated { declared, actual }) => {
                debug!(declared, actual, "packet truncated, advising peer to shrink mtu");
                self.send_shrink_advisory(bytes, peer, actual);
                return;
            }
            Err(error) => {
                debug!(%error, "dropping malformed datagram");
                return;
            }
        };
        let key = ConnectionKey::new(packet.dest_port, packet.source_port, peer);

        if self.connections.contains_key(&key) {
            let effects = self
                .connections
                .get_mut(&key)
                .unwrap()
                .connection
                .packet_received(packet);
            self.apply(key, effects).await;
            return;
        }

        if packet.flags.syn() && !packet.flags.ack() {
            if let Some(factory) = self.listeners.get(&packet.dest_port).cloned() {
                self.accept_connection(key, packet, factory).await;
                return;
            }
        }

        if !packet.flags.rst() {
            debug!(%key, "no connection or listener for inbound packet");
        }
    }

    async fn accept_connection(
        &mut self,
        key: ConnectionKey,
        syn: Packet,
        factory: Arc<dyn ServerFactory>,
    ) {
        let iss = self.isn.generate();
        let (connection, syn_ack) = Connection::accept(key, iss, &syn, self.config.clone());

        let host = PtcpAddress::new(
            self.transport.local_addr().unwrap_or(key.peer_addr),
            key.local_port,
        );
        let peer_addr = PtcpAddress::new(key.peer_addr, key.peer_port);
        let mut protocol = factory.build_protocol(peer_addr);
        let handle = Arc::new(ConnectionHandle {
            key,
            host,
            peer: peer_addr,
            commands: self.command_tx.clone(),
        });
        protocol.make_connection(handle).await;

        self.connections.insert(
            key,
            Entry {
                connection,
                protocol,
                client_factory: None,
            },
        );
        self.send_packet(key, syn_ack).await;
    }

    async fn deliver_timer(&mut self, fired: TimerFired) {
        self.timers.remove(&(fired.conn, fired.kind));
        let Some(entry) = self.connections.get_mut(&fired.conn) else {
            return;
        };
        let effects = entry.connection.timer_fired(fired.kind);
        self.apply(fired.conn, effects).await;
    }

    async fn deliver_command(&mut self, command: Command) {
        let Some(entry) = self.connections.get_mut(&command.key) else {
            return;
        };
        let effects = match command.body {
            CommandBody::Write(data) => entry.connection.send(data),
            CommandBody::LoseConnection => entry.connection.close(),
            CommandBody::RegisterProducer(producer, streaming) => {
                entry.connection.register_producer(producer, streaming);
                Effects::default()
            }
            CommandBody::UnregisterProducer => {
                entry.connection.unregister_producer();
                Effects::default()
            }
            CommandBody::PauseProducing => {
                entry.connection.pause_producing();
                Effects::default()
            }
            CommandBody::ResumeProducing => {
                entry.connection.resume_producing();
                Effects::default()
            }
        };
        self.apply(command.key, effects).await;
    }

    /// Carry out the [`Effects`] a `Connection` method returned: send
    /// packets, (re)arm or cancel timers, deliver data to the application,
    /// and tear the connection down if it's closed.
    async fn apply(&mut self, key: ConnectionKey, effects: Effects) {
        for packet in effects.send {
            self.send_packet(key, packet).await;
        }

        for (kind, delay) in effects.schedule {
            if let Some(old) = self.timers.remove(&(key, kind)) {
                self.scheduler.cancel(old);
            }
            let handle = self.scheduler.schedule(delay, key, kind);
            self.timers.insert((key, kind), handle);
        }
        for kind in effects.cancel {
            if let Some(old) = self.timers.remove(&(key, kind)) {
                self.scheduler.cancel(old);
            }
        }

        if let Some(data) = effects.deliver {
            if let Some(entry) = self.connections.get_mut(&key) {
                entry.protocol.data_received(data).await;
            }
        }

        if effects.established {
            // `make_connection` already fired at connection-creation time
            // (Twisted-style); nothing further to notify the application of.
        }

        if effects.closed {
            if let Some(mut entry) = self.connections.remove(&key) {
                for kind in [
                    TimerKind::SendDelay,
                    TimerKind::AckDelay,
                    TimerKind::Retransmit,
                    TimerKind::TimeWait,
                    TimerKind::HalfClose,
                ] {
                    if let Some(handle) = self.timers.remove(&(key, kind)) {
                        self.scheduler.cancel(handle);
                    }
                }

                let reason = effects.reset.map(|e| e.to_string());
                if !entry.connection.reached_established() {
                    if let Some(mut client_factory) = entry.client_factory.take() {
                        client_factory.client_connection_failed(ConnectError::Reset);
                    }
                }
                entry.protocol.connection_lost(reason).await;
            }
            if self.connections.is_empty() {
                self.all_closed.notify_waiters();
                if self.live && self.listeners.is_empty() {
                    self.live = false;
                }
            }
        }
    }

    /// Waits until every connection on this multiplexer has closed.
    /// Mirrors the reference implementation's
    /// `waitForAllConnectionsToClose`.
    pub async fn all_connections_closed(&self) {
        if self.connections.is_empty() {
            return;
        }
        self.all_closed.notified().await;
    }

    /// Tears the multiplexer down: stops accepting new connections and
    /// closes every open one without sending a FIN or RST, as if the
    /// underlying transport had simply gone away. Idempotent.
    pub async fn stop_protocol(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        self.listeners.clear();

        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            if let Some(mut entry) = self.connections.remove(&key) {
                for kind in [
                    TimerKind::SendDelay,
                    TimerKind::AckDelay,
                    TimerKind::Retransmit,
                    TimerKind::TimeWait,
                    TimerKind::HalfClose,
                ] {
                    if let Some(handle) = self.timers.remove(&(key, kind)) {
                        self.scheduler.cancel(handle);
                    }
                }
                if !entry.connection.reached_established() {
                    if let Some(mut client_factory) = entry.client_factory.take() {
                        client_factory.client_connection_failed(ConnectError::Reset);
                    }
                }
                entry
                    .protocol
                    .connection_lost(Some("transport gone away".to_string()))
                    .await;
            }
        }
        self.all_closed.notify_waiters();
    }

    /// Stops the multiplexer and waits for every connection's teardown
    /// notification to have fired. The combination `stop_protocol` plus
    /// `all_connections_closed` callers reach for when shutting a
    /// multiplexer down deliberately rather than letting it idle closed.
    pub async fn cleanup_and_close(&mut self) {
        self.stop_protocol().await;
        self.all_connections_closed().await;
    }
}
