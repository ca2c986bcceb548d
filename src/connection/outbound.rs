//! The outbound path: turning application writes into segments on the
//! wire. Coalesce small writes behind a short send-delay timer (Nagle-lite),
//! segment to the connection's MTU, hand each segment to the
//! retransmission queue, and keep resending anything not yet acknowledged
//! until either it is, or the connection gives up and resets.

use super::{Connection, Effects, Transmit};
use crate::{
    message::Message,
    packet::{Flags, Packet},
    state::{Input, Output, State},
    timer::TimerKind,
};

impl Connection {
    /// The application wrote data. Queues it and arms the send-delay timer
    /// if it isn't already running; the actual segmentation happens when
    /// that timer fires, so that several writes in quick succession are
    /// coalesced into one segment instead of one packet each.
    pub fn send(&mut self, data: Message) -> Effects {
        if data.is_empty() || !self.state.can_send() {
            return Effects::default();
        }
        self.outgoing.text.push_back(data);
        Effects {
            schedule: vec![(TimerKind::SendDelay, self.config.send_delay)],
            ..Default::default()
        }
    }

    pub(super) fn fire_send_delay(&mut self) -> Effects {
        self.flush()
    }

    /// Segment everything queued in `outgoing.text` that fits within the
    /// peer's advertised window, fragment to the connection MTU, and move
    /// the results onto the retransmission queue.
    fn flush(&mut self) -> Effects {
        let mut effects = Effects::default();
        let window_end = self.send.una.wrapping_add(self.send.wnd as u32);

        while let Some(chunk) = self.outgoing.text.front() {
            let allowed = crate::seq::mod_lt(self.send.nxt, window_end);
            if !allowed || chunk.is_empty() {
                break;
            }
            let remaining_window = window_end.wrapping_sub(self.send.nxt) as usize;
            if remaining_window == 0 {
                break;
            }
            let take = chunk.len().min(remaining_window);
            let mut chunk = self.outgoing.text.pop_front().unwrap();
            let rest = if take < chunk.len() {
                let tail = chunk.cut(take);
                self.outgoing.text.push_front(chunk);
                tail
            } else {
                chunk
            };

            let packet = Packet::new(
                self.key.local_port,
                self.key.peer_port,
                self.send.nxt,
                self.recv.nxt,
                Flags::ACK,
                self.recv.wnd as u32,
                rest,
            );
            self.enqueue_for_transmission(packet, &mut effects);
        }

        if !self.outgoing.retransmit.is_empty() {
            effects
                .schedule
                .push((TimerKind::Retransmit, self.config.retransmit_interval));
        }
        effects
    }

    fn enqueue_for_transmission(&mut self, packet: Packet, effects: &mut Effects) {
        let old_nxt = self.send.nxt;
        self.send.nxt = self.send.nxt.wrapping_add(packet.segment_length());
        self.send.lap.advance(old_nxt, self.send.nxt);

        for fragment in packet.fragment(self.mtu) {
            effects.send.push(fragment.clone());
            self.outgoing.retransmit.push_back(Transmit {
                packet: fragment,
                retransmit_count: self.config.max_retransmits,
            });
        }

        let window_end = self.send.una.wrapping_add(self.send.wnd as u32);
        if !crate::seq::mod_lt(self.send.nxt, window_end) {
            self.write_buffer_full();
        }
    }

    /// The retransmit timer fired: decrement each outstanding segment's
    /// retry budget, refresh its `ack` field to the current receive
    /// cursor, and resend it; give up and reset the connection as soon as
    /// any segment's budget would be spent.
    pub(super) fn fire_retransmit(&mut self) -> Effects {
        if self.outgoing.retransmit.is_empty() {
            return Effects::default();
        }
        if self.outgoing.retransmit.iter().any(|t| t.retransmit_count <= 1) {
            return self.reset_for_timeout();
        }

        let recv_nxt = self.recv.nxt;
        let mut effects = Effects::default();
        for transmit in self.outgoing.retransmit.iter_mut() {
            transmit.retransmit_count -= 1;
            transmit.packet.ack = recv_nxt;
            effects.send.push(transmit.packet.clone());
        }
        effects
            .schedule
            .push((TimerKind::Retransmit, self.config.retransmit_interval));
        effects
    }

    /// Feed a retransmit-budget exhaustion through the state machine: only
    /// a half-open `SynReceived` connection has anything on the wire worth
    /// resetting, everywhere else the retry budget running out just means
    /// the local side gives up and reports the connection as gone.
    fn reset_for_timeout(&mut self) -> Effects {
        let Some(transition) = self.state.on(Input::Timeout) else {
            return Effects::default();
        };
        self.state = transition.next;

        let mut send = Vec::new();
        if transition.output == Output::SendRst {
            send.push(self.send_rst());
        }
        Effects {
            send,
            closed: true,
            reset: Some(crate::error::ProtocolError::Timeout {
                local: self.key.local_port,
                peer: self.key.peer_port,
            }),
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

    /// The application asked to close the connection: flush any queued
    /// data, then send a FIN and move to the appropriate closing state.
    pub fn close(&mut self) -> Effects {
        let input = if self.state == State::CloseWait {
            Input::Close
        } else if self.state.can_send() {
            Input::Close
        } else {
            return Effects::default();
        };
        let Some(transition) = self.state.on(input) else {
            return Effects::default();
        };
        self.state = transition.next;

        let mut effects = self.flush();
        let fin = Packet::new(
            self.key.local_port,
            self.key.peer_port,
            self.send.nxt,
            self.recv.nxt,
            Flags::FIN | Flags::ACK,
            self.recv.wnd as u32,
            Message::new(Vec::new()),
        );
        self.fin_seq = Some(self.send.nxt);
        self.send.nxt = self.send.nxt.wrapping_add(1);
        effects.send.push(fin.clone());
        self.outgoing.retransmit.push_back(Transmit {
            packet: fin,
            retransmit_count: self.config.max_retransmits,
        });
        effects
            .schedule
            .push((TimerKind::Retransmit, self.config.retransmit_interval));
        effects
    }
}
