//! The inbound path: turning an arrived packet (or a fired timer) into
//! state transitions and [`Effects`] for the caller to carry out.
//!
//! Steps below follow spec.md §4.4:
//! 1. RST tears the connection down unconditionally.
//! 2. SYN/SYN+ACK drive the handshake.
//! 3. An ACK advances `SND.UNA`, trims the retransmission queue, and is
//!    checked against our outstanding FIN.
//! 4. Window updates are taken from every acceptable segment, not just new
//!    data.
//! 5. A FIN advances `RCV.NXT` past it and is acknowledged.
//! 6. In-order data is handed to the application and acknowledged (subject
//!    to ack-delay coalescing).
//! 7. Segments that arrive out of order (sequence number ahead of
//!    `RCV.NXT`) are dropped without buffering or acknowledgment. PTCP
//!    does not reorder; the sender's retransmission timer will resend, and
//!    this keeps the receive side free of an unbounded reorder buffer.
//! 8-10. Duplicate (already-seen) data is silently dropped but still
//!    acknowledged, since the peer's copy of our last ACK was evidently lost.

use super::{Connection, Effects, Transmit};
use crate::{
    error::ProtocolError,
    packet::Packet,
    state::{Input, State},
    timer::TimerKind,
};

impl Connection {
    /// Handle an inbound packet already known to belong to this connection
    /// (checksum verified, ports matched) and return what the caller should
    /// do about it.
    pub fn packet_received(&mut self, packet: Packet) -> Effects {
        if packet.flags.rst() {
            return self.reset(ProtocolError::ResetByPeer {
                local: self.key.local_port,
                peer: self.key.peer_port,
            });
        }

        if packet.flags.stb() {
            return self.shrink_mtu(&packet);
        }

        if self.paused {
            return Effects::default();
        }

        match self.state {
            State::SynSent => self.handle_in_syn_sent(packet),
            _ => self.handle_established_or_closing(packet),
        }
    }

    /// The peer couldn't parse one of our segments whole and measured how
    /// much of it actually arrived; shrink our MTU to that and refragment
    /// anything still outstanding so it fits.
    fn shrink_mtu(&mut self, packet: &Packet) -> Effects {
        let observed = packet.payload.to_vec();
        if observed.len() < 2 {
            return Effects::default();
        }
        let new_mtu = u16::from_be_bytes([observed[0], observed[1]]) as usize;
        if new_mtu == 0 || new_mtu >= self.mtu {
            return Effects::default();
        }
        self.mtu = new_mtu;

        let mut refragmented = std::collections::VecDeque::new();
        for transmit in std::mem::take(&mut self.outgoing.retransmit) {
            for fragment in transmit.packet.fragment(self.mtu) {
                refragmented.push_back(Transmit {
                    packet: fragment,
                    retransmit_count: transmit.retransmit_count,
                });
            }
        }
        self.outgoing.retransmit = refragmented;
        Effects::default()
    }

    fn reset(&mut self, reason: ProtocolError) -> Effects {
        self.state = State::Closed;
        Effects {
            closed: true,
            reset: Some(reason),
            cancel: vec![
                TimerKind::SendDelay,
                TimerKind::AckDelay,
                TimerKind::Retransmit,
                TimerKind::TimeWait,
                TimerKind::HalfClose,
            ],
            ..Default::default()
        }
    }

    fn handle_in_syn_sent(&mut self, packet: Packet) -> Effects {
        if !packet.flags.syn() {
            return Effects::default();
        }
        self.recv.irs = packet.seq;
        self.recv.nxt = packet.seq.wrapping_add(1);

        let input = if packet.flags.ack() {
            Input::SynAck
        } else {
            Input::Syn
        };
        let Some(transition) = self.state.on(input) else {
            return Effects::default();
        };
        self.state = transition.next;
        if self.state == State::Established {
            self.reached_established = true;
        }

        let mut effects = Effects {
            established: matches!(self.state, State::Established),
            ..Default::default()
        };
        if packet.flags.ack() {
            self.send.una = packet.ack;
        }
        self.send.wnd = packet.window.min(u16::MAX as u32) as u16;
        effects.send.push(self.ack_packet());
        effects
    }

    fn handle_established_or_closing(&mut self, packet: Packet) -> Effects {
        let mut effects = Effects::default();

        if packet.flags.syn() {
            if !packet.payload.is_empty() {
                return self.reset(ProtocolError::SynWithData(packet.payload.len()));
            }
            // A retransmitted SYN carrying the ISN we already recorded is
            // the client resending before our SYN+ACK landed; tolerate it.
            // Only a mismatching ISN is a protocol violation.
            if packet.seq == self.recv.irs {
                return Effects::default();
            }
            return self.reset(ProtocolError::IsnMismatch {
                recorded: self.recv.irs,
                offered: packet.seq,
            });
        }

        if self.state == State::SynReceived && packet.flags.ack() {
            if let Some(transition) = self.state.on(Input::Ack) {
                self.state = transition.next;
                if self.state == State::Established {
                    self.reached_established = true;
                    effects.established = true;
                }
            }
        }

        if packet.flags.ack() {
            self.send.wnd = packet.window.min(u16::MAX as u32) as u16;
            self.process_ack(packet.ack, &mut effects);
        }

        let seg_len = packet.segment_length();
        if seg_len > 0 {
            self.process_segment(packet, &mut effects);
        }

        effects
    }

    fn process_ack(&mut self, ack: u32, effects: &mut Effects) {
        use crate::seq::ack_acceptable;
        if !ack_acceptable(ack, self.send.una, self.send.nxt) && ack != self.send.una {
            return;
        }
        self.send.una = ack;
        self.outgoing
            .retransmit
            .retain(|t| crate::seq::mod_gt(t.packet.seq.wrapping_add(t.packet.segment_length()), ack));

        if self.outgoing.retransmit.is_empty() {
            effects.cancel.push(TimerKind::Retransmit);
            self.write_buffer_empty();
        }

        if let Some(fin_seq) = self.fin_seq {
            if crate::seq::mod_geq(ack, fin_seq.wrapping_add(1)) {
                self.fin_seq = None;
                let transition = self.state.on(Input::AckOfFin);
                if let Some(t) = transition {
                    self.state = t.next;
                    if self.state == State::TimeWait {
                        effects
                            .schedule
                            .push((TimerKind::TimeWait, self.config.time_wait));
                    }
                    if self.state == State::Closed {
                        effects.closed = true;
                    }
                }
            }
        }
    }

    fn process_segment(&mut self, packet: Packet, effects: &mut Effects) {
        if crate::seq::mod_gt(packet.seq, self.recv.nxt) {
            // Step 7: future segment, drop without buffering or acking.
            return;
        }
        if crate::seq::mod_lt(packet.seq, self.recv.nxt) {
            // Already-seen data: drop the payload but still ack, the peer
            // evidently never saw our previous ack.
            self.ack_owed = true;
            effects.schedule.push((TimerKind::AckDelay, self.config.ack_delay));
            return;
        }

        let old_nxt = self.recv.nxt;
        if !packet.payload.is_empty() {
            self.recv.nxt = self.recv.nxt.wrapping_add(packet.payload.len() as u32);
            self.recv.lap.advance(old_nxt, self.recv.nxt);
            effects.deliver = Some(packet.payload.clone());
        }

        if packet.flags.fin() {
            let advanced_nxt = self.recv.nxt.wrapping_add(1);
            self.recv.lap.advance(self.recv.nxt, advanced_nxt);
            self.recv.nxt = advanced_nxt;
            if let Some(transition) = self.state.on(Input::Fin) {
                self.state = transition.next;
                if self.state == State::CloseWait {
                    effects
                        .schedule
                        .push((TimerKind::HalfClose, self.config.half_close_delay));
                }
            }
        }

        self.ack_owed = true;
        effects.schedule.push((TimerKind::AckDelay, self.config.ack_delay));
    }

    /// A scheduled timer expired; decide what to do about it.
    pub fn timer_fired(&mut self, kind: TimerKind) -> Effects {
        match kind {
            TimerKind::AckDelay => self.fire_ack_delay(),
            TimerKind::Retransmit => self.fire_retransmit(),
            TimerKind::SendDelay => self.fire_send_delay(),
            TimerKind::TimeWait => self.fire_time_wait(),
            TimerKind::HalfClose => self.fire_half_close(),
        }
    }

    fn fire_ack_delay(&mut self) -> Effects {
        if !self.ack_owed {
            return Effects::default();
        }
        self.ack_owed = false;
        Effects::send_one(self.ack_packet())
    }

    fn fire_time_wait(&mut self) -> Effects {
        if let Some(transition) = self.state.on(Input::TimeWaitTimeout) {
            self.state = transition.next;
        }
        Effects {
            closed: true,
            ..Default::default()
        }
    }

    fn fire_half_close(&mut self) -> Effects {
        if self.state != State::CloseWait {
            return Effects::default();
        }
        self.close()
    }
}
