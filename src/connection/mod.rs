//! The connection engine: per-connection protocol state plus the send and
//! receive sequence spaces, driven by inbound packets, application writes,
//! and timer callbacks.
//!
//! A [`Connection`] owns no `Mutex` or scheduler/transport handle of its
//! own; per spec.md §5's no-locks, no-shared-state requirement, it is
//! plain data plus pure functions (the one exception, a registered
//! [`Producer`] handle, is called synchronously and never shared outside
//! this connection). Each entry point (`packet_received`, `send`, `close`,
//! `timer_fired`) returns an [`Effects`] value describing what the caller
//! (always a [`crate::multiplexer::Multiplexer`] that *does* own the
//! transport and scheduler) should do about it: packets to put on the
//! wire, bytes to hand the application, timers to (re)arm or cancel. This
//! is the same "declarative transition table" shape as the state machine
//! in [`crate::state`], extended to cover data and timers.

pub mod handle;
pub mod inbound;
pub mod outbound;

use crate::{
    address::ConnectionKey,
    application::Producer,
    config::Config,
    error::ProtocolError,
    message::Message,
    packet::{Flags, Packet},
    seq::Lap,
    state::State,
    timer::TimerKind,
};
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

/// `SND.UNA`/`SND.NXT`/`SND.WND` and friends (RFC 793 page 19).
#[derive(Debug, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub iss: u32,
    pub lap: Lap,
}

/// `RCV.NXT`/`RCV.WND` and friends.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveSequenceSpace {
    pub irs: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub lap: Lap,
}

/// A segment sitting in the retransmission queue: the packet as sent, and
/// how many more times the retransmit timer may fire on it before the
/// connection gives up and times out.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub packet: Packet,
    pub retransmit_count: u32,
}

/// The outgoing side of a connection: data queued by the application but
/// not yet segmented, and the retransmission queue of segments already
/// sent but not yet acknowledged.
#[derive(Debug, Default)]
pub struct Outgoing {
    pub text: VecDeque<Message>,
    pub retransmit: VecDeque<Transmit>,
}

impl Outgoing {
    pub fn queued_bytes(&self) -> usize {
        self.text.iter().map(Message::len).sum::<usize>()
            + self
                .retransmit
                .iter()
                .map(|t| t.packet.payload.len())
                .sum::<usize>()
    }
}

/// Everything a [`Connection`] method wants its caller to do in response to
/// one input. Every field defaults empty/false/None, so call sites only
/// need to handle the parts that matter to them.
#[derive(Debug, Default)]
pub struct Effects {
    /// Packets to hand the transport, in order.
    pub send: Vec<Packet>,
    /// Bytes to deliver to the application via `data_received`, if any
    /// arrived in order.
    pub deliver: Option<Message>,
    /// Timers to (re)arm, replacing any existing timer of the same kind.
    pub schedule: Vec<(TimerKind, Duration)>,
    /// Timers to cancel outright.
    pub cancel: Vec<TimerKind>,
    /// Set once, the first time the handshake completes.
    pub established: bool,
    /// Set once the connection has reached `Closed` and should be removed
    /// from the multiplexer's table.
    pub closed: bool,
    /// Set if the connection is closing abnormally; carries the reason to
    /// report via `connection_lost`/`client_connection_failed`.
    pub reset: Option<ProtocolError>,
}

impl Effects {
    fn send_one(packet: Packet) -> Self {
        Self {
            send: vec![packet],
            ..Default::default()
        }
    }
}

/// A single PTCP connection's protocol state.
pub struct Connection {
    pub key: ConnectionKey,
    pub state: State,
    pub send: SendSequenceSpace,
    pub recv: ReceiveSequenceSpace,
    pub mtu: usize,
    pub config: Config,
    pub outgoing: Outgoing,
    /// Sequence number of our outstanding FIN, once sent, so we can
    /// recognize the ACK that completes our half of the close.
    fin_seq: Option<u32>,
    /// Whether an ACK is owed to the peer but hasn't been sent yet (the
    /// ack-delay timer is running, hoping to piggyback it on outgoing
    /// data instead of sending a bare ACK).
    ack_owed: bool,
    /// Whether this connection ever reached `Established`, so the
    /// multiplexer knows whether tearing it down should notify a
    /// `ClientFactory` of a failed connection attempt or a `PtcpProtocol`
    /// of an ordinary connection loss.
    reached_established: bool,
    /// Whether the application has paused inbound delivery on this
    /// connection (`PtcpTransport::pause_producing`). While set, arriving
    /// segments are dropped without being acknowledged or buffered.
    paused: bool,
    /// The application's registered write-buffer producer, if any.
    producer: Option<Arc<dyn Producer>>,
    /// Whether `producer` is a streaming producer (resumed only by
    /// `resume_producing`) or a pull producer (resumed as soon as the
    /// outgoing queue drains, per `register_producer`'s non-streaming
    /// case).
    streaming_producer: bool,
    /// Whether `producer` is currently paused because the send window
    /// filled up.
    producer_paused: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("mtu", &self.mtu)
            .field("config", &self.config)
            .field("outgoing", &self.outgoing)
            .field("fin_seq", &self.fin_seq)
            .field("ack_owed", &self.ack_owed)
            .field("reached_established", &self.reached_established)
            .field("paused", &self.paused)
            .field("producer", &self.producer.is_some())
            .field("streaming_producer", &self.streaming_producer)
            .field("producer_paused", &self.producer_paused)
            .finish()
    }
}

impl Connection {
    pub fn reached_established(&self) -> bool {
        self.reached_established
    }

    /// Begin an active open: the application called `connect`. Returns the
    /// new connection (in `SynSent`) and the SYN to transmit.
    pub fn open(key: ConnectionKey, iss: u32, config: Config) -> (Self, Packet) {
        let mtu = config.initial_mtu;
        let conn = Self {
            key,
            state: State::SynSent,
            send: SendSequenceSpace {
                una: iss,
                nxt: iss.wrapping_add(1),
                wnd: 0,
                iss,
                lap: Lap::default(),
            },
            recv: ReceiveSequenceSpace {
                irs: 0,
                nxt: 0,
                wnd: config.receive_window,
                lap: Lap::default(),
            },
            mtu,
            config,
            outgoing: Outgoing::default(),
            fin_seq: None,
            ack_owed: false,
            reached_established: false,
            paused: false,
            producer: None,
            streaming_producer: false,
            producer_paused: false,
        };
        let syn = Packet::new(
            key.local_port,
            key.peer_port,
            iss,
            0,
            Flags::SYN,
            conn.recv.wnd as u32,
            Message::new(Vec::new()),
        );
        (conn, syn)
    }

    /// Synthesize a connection for an inbound bare SYN (the multiplexer's
    /// passive-open path). Returns the new connection (in `SynReceived`)
    /// and the SYN+ACK to transmit.
    pub fn accept(key: ConnectionKey, iss: u32, peer_syn: &Packet, config: Config) -> (Self, Packet) {
        let mtu = config.initial_mtu;
        let conn = Self {
            key,
            state: State::SynReceived,
            send: SendSequenceSpace {
                una: iss,
                nxt: iss.wrapping_add(1),
                wnd: peer_syn.window.min(u16::MAX as u32) as u16,
                iss,
                lap: Lap::default(),
            },
            recv: ReceiveSequenceSpace {
                irs: peer_syn.seq,
                nxt: peer_syn.seq.wrapping_add(1),
                wnd: config.receive_window,
                lap: Lap::default(),
            },
            mtu,
            config,
            outgoing: Outgoing::default(),
            fin_seq: None,
            ack_owed: false,
            reached_established: false,
            paused: false,
            producer: None,
            streaming_producer: false,
            producer_paused: false,
        };
        let syn_ack = Packet::new(
            key.local_port,
            key.peer_port,
            iss,
            conn.recv.nxt,
            Flags::SYN | Flags::ACK,
            conn.recv.wnd as u32,
            Message::new(Vec::new()),
        );
        (conn, syn_ack)
    }

    pub fn status(&self) -> State {
        self.state
    }

    fn send_rst(&self) -> Packet {
        Packet::new(
            self.key.local_port,
            self.key.peer_port,
            self.send.nxt,
            0,
            Flags::RST,
            0,
            Message::new(Vec::new()),
        )
    }

    fn ack_packet(&self) -> Packet {
        Packet::new(
            self.key.local_port,
            self.key.peer_port,
            self.send.nxt,
            self.recv.nxt,
            Flags::ACK,
            self.recv.wnd as u32,
            Message::new(Vec::new()),
        )
    }

    /// Stop delivering inbound data to the application; arriving segments
    /// are dropped rather than buffered until `resume_producing`.
    pub fn pause_producing(&mut self) {
        self.paused = true;
    }

    pub fn resume_producing(&mut self) {
        self.paused = false;
    }

    /// Register the application's write-buffer producer. A non-streaming
    /// (pull) producer that registers while the outgoing queue is already
    /// empty is resumed immediately, since it will never otherwise see a
    /// `write_buffer_empty` callback to tell it to start.
    pub fn register_producer(&mut self, producer: Arc<dyn Producer>, streaming: bool) {
        self.producer = Some(producer);
        self.streaming_producer = streaming;
        self.producer_paused = false;
        if !streaming && self.outgoing.queued_bytes() == 0 {
            self.resume_registered_producer();
        }
    }

    pub fn unregister_producer(&mut self) {
        self.producer = None;
        self.streaming_producer = false;
        self.producer_paused = false;
    }

    fn resume_registered_producer(&mut self) {
        if let Some(producer) = self.producer.clone() {
            producer.resume_producing();
        }
    }

    /// Called once the send window is found exhausted after enqueueing a
    /// segment: pause the registered producer, if any and not already
    /// paused.
    pub(super) fn write_buffer_full(&mut self) {
        if self.producer_paused {
            return;
        }
        if let Some(producer) = self.producer.clone() {
            self.producer_paused = true;
            producer.pause_producing();
        }
    }

    /// Called once the outgoing queue drains to empty: resume a streaming
    /// producer, or a non-streaming one only if it's currently paused.
    pub(super) fn write_buffer_empty(&mut self) {
        if self.producer.is_none() {
            return;
        }
        if self.streaming_producer {
            if self.producer_paused {
                self.producer_paused = false;
                self.resume_registered_producer();
            }
        } else {
            self.producer_paused = false;
            self.resume_registered_producer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new(1, 2, "127.0.0.1:9000".parse().unwrap())
    }

    fn synack_for(syn: &Packet, peer_iss: u32, config: &Config) -> Packet {
        Packet::new(
            syn.dest_port,
            syn.source_port,
            peer_iss,
            syn.seq.wrapping_add(1),
            Flags::SYN | Flags::ACK,
            config.receive_window as u32,
            Message::new(Vec::new()),
        )
    }

    /// Drives a fresh active-open `Connection` through the three-way
    /// handshake and returns it in `Established`.
    fn established(config: Config) -> Connection {
        let (mut conn, syn) = Connection::open(key(), 100, config.clone());
        let synack = synack_for(&syn, 5000, &config);
        let effects = conn.packet_received(synack);
        assert!(effects.established);
        assert_eq!(conn.state, State::Established);
        conn
    }

    #[test]
    fn three_way_handshake_reaches_established_and_acks() {
        let conn = established(Config::default());
        assert!(conn.reached_established());
        assert_eq!(conn.send.una, 100);
    }

    #[test]
    fn in_order_data_is_delivered_and_ack_is_owed() {
        let mut conn = established(Config::default());
        let data = Packet::new(
            conn.key.peer_port,
            conn.key.local_port,
            conn.recv.nxt,
            conn.send.nxt,
            Flags::ACK,
            4096,
            Message::new(b"hi".to_vec()),
        );
        let effects = conn.packet_received(data);
        assert_eq!(effects.deliver.map(|m| m.to_vec()), Some(b"hi".to_vec()));
        assert!(effects.schedule.iter().any(|(k, _)| *k == TimerKind::AckDelay));
    }

    #[test]
    fn future_segment_is_dropped_without_delivery_or_ack() {
        let mut conn = established(Config::default());
        let future = Packet::new(
            conn.key.peer_port,
            conn.key.local_port,
            conn.recv.nxt.wrapping_add(50),
            conn.send.nxt,
            Flags::ACK,
            4096,
            Message::new(b"from the future".to_vec()),
        );
        let effects = conn.packet_received(future);
        assert!(effects.deliver.is_none());
        assert!(effects.schedule.is_empty());
    }

    #[test]
    fn retransmit_exhaustion_in_established_closes_without_rst() {
        let config = Config::default();
        let mut conn = established(config.clone());

        let send_effects = conn.send(Message::new(b"payload".to_vec()));
        assert!(send_effects
            .schedule
            .iter()
            .any(|(k, _)| *k == TimerKind::SendDelay));
        let flushed = conn.timer_fired(TimerKind::SendDelay);
        assert!(!flushed.send.is_empty());
        assert!(!conn.outgoing.retransmit.is_empty());

        for _ in 0..config.max_retransmits - 1 {
            let effects = conn.timer_fired(TimerKind::Retransmit);
            assert!(!effects.closed, "should not give up before the retry budget is spent");
        }

        let final_effects = conn.timer_fired(TimerKind::Retransmit);
        assert!(final_effects.closed);
        assert!(final_effects.reset.is_some());
        assert!(
            !final_effects.send.iter().any(|p| p.flags.rst()),
            "a timeout in Established has nothing worth resetting on the wire"
        );
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn retransmit_exhaustion_in_syn_received_sends_rst() {
        let config = Config::default();
        let peer_syn = Packet::new(
            2,
            1,
            5000,
            0,
            Flags::SYN,
            config.receive_window as u32,
            Message::new(Vec::new()),
        );
        let (mut conn, syn_ack) = Connection::accept(key(), 100, &peer_syn, config.clone());
        assert_eq!(conn.state, State::SynReceived);

        // The peer never acked our SYN+ACK; its retry budget has just run
        // out on the retransmit timer's last firing.
        conn.outgoing.retransmit.push_back(Transmit {
            packet: syn_ack,
            retransmit_count: 1,
        });
        let effects = conn.timer_fired(TimerKind::Retransmit);
        assert!(effects.closed);
        assert!(effects.send.iter().any(|p| p.flags.rst()));
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn duplicate_syn_with_matching_isn_is_tolerated() {
        let config = Config::default();
        let peer_syn = Packet::new(2, 1, 5000, 0, Flags::SYN, config.receive_window as u32, Message::new(Vec::new()));
        let (mut conn, _syn_ack) = Connection::accept(key(), 100, &peer_syn, config);
        assert_eq!(conn.state, State::SynReceived);

        let retransmitted_syn = Packet::new(2, 1, 5000, 0, Flags::SYN, 0, Message::new(Vec::new()));
        let effects = conn.packet_received(retransmitted_syn);
        assert!(effects.send.is_empty());
        assert!(!effects.closed);
        assert_eq!(conn.state, State::SynReceived);
    }

    #[test]
    fn syn_with_mismatching_isn_is_a_protocol_error() {
        let config = Config::default();
        let peer_syn = Packet::new(2, 1, 5000, 0, Flags::SYN, config.receive_window as u32, Message::new(Vec::new()));
        let (mut conn, _syn_ack) = Connection::accept(key(), 100, &peer_syn, config);

        let mismatched_syn = Packet::new(2, 1, 9999, 0, Flags::SYN, 0, Message::new(Vec::new()));
        let effects = conn.packet_received(mismatched_syn);
        assert!(effects.closed);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn fin_in_established_arms_half_close_timer() {
        let mut conn = established(Config::default());
        let fin = Packet::new(
            conn.key.peer_port,
            conn.key.local_port,
            conn.recv.nxt,
            conn.send.nxt,
            Flags::FIN | Flags::ACK,
            4096,
            Message::new(Vec::new()),
        );
        let effects = conn.packet_received(fin);
        assert_eq!(conn.state, State::CloseWait);
        assert!(effects.schedule.iter().any(|(k, _)| *k == TimerKind::HalfClose));

        let half_close_effects = conn.timer_fired(TimerKind::HalfClose);
        assert!(half_close_effects.send.iter().any(|p| p.flags.fin()));
        assert_eq!(conn.state, State::LastAck);
    }

    struct RecordingProducer {
        paused: std::sync::atomic::AtomicBool,
        resumed: std::sync::atomic::AtomicBool,
    }

    impl crate::application::Producer for RecordingProducer {
        fn pause_producing(&self) {
            self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        fn resume_producing(&self) {
            self.resumed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn registered_producer_is_paused_when_send_window_fills() {
        let mut config = Config::default();
        config.receive_window = 4;
        let mut conn = established(config);

        let producer = std::sync::Arc::new(RecordingProducer {
            paused: std::sync::atomic::AtomicBool::new(false),
            resumed: std::sync::atomic::AtomicBool::new(false),
        });
        conn.register_producer(producer.clone(), true);

        conn.send(Message::new(b"more than four bytes".to_vec()));
        conn.timer_fired(TimerKind::SendDelay);
        assert!(producer.paused.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn paused_connection_drops_inbound_packets() {
        let mut conn = established(Config::default());
        conn.pause_producing();
        let data = Packet::new(
            conn.key.peer_port,
            conn.key.local_port,
            conn.recv.nxt,
            conn.send.nxt,
            Flags::ACK,
            4096,
            Message::new(b"hi".to_vec()),
        );
        let before_nxt = conn.recv.nxt;
        let effects = conn.packet_received(data);
        assert!(effects.deliver.is_none());
        assert_eq!(conn.recv.nxt, before_nxt);
    }

    #[test]
    fn stb_advisory_shrinks_mtu_and_refragments_retransmit_queue() {
        let config = Config::default();
        let mut conn = established(config.clone());
        let initial_mtu = conn.mtu;

        let send_effects = conn.send(Message::new(vec![9u8; initial_mtu + 200]));
        assert!(!send_effects.schedule.is_empty());
        conn.timer_fired(TimerKind::SendDelay);
        assert!(conn.outgoing.retransmit.len() >= 2);

        let observed: u16 = 200;
        let stb = Packet::new(
            conn.key.peer_port,
            conn.key.local_port,
            0,
            0,
            Flags::STB,
            0,
            Message::new(observed.to_be_bytes().to_vec()),
        );
        let effects = conn.packet_received(stb);
        assert!(effects.send.is_empty());
        assert_eq!(conn.mtu, observed as usize);
        assert!(conn
            .outgoing
            .retransmit
            .iter()
            .all(|t| t.packet.payload.len() <= observed as usize));
    }
}
