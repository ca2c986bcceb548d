//! The connection state machine: the eleven states of RFC 793 §3.2's
//! connection diagram, and the table-driven transitions between them.
//!
//! ```text
//!                             +---------+ ---------\      active OPEN
//!                             |  CLOSED |            \    -----------
//!                             +---------+<---------\   \   create TCB
//!                               |     ^              \   \  snd SYN
//!                  passive OPEN |     |   CLOSE        \   \
//!                  ------------ |     | ----------       \   \
//!                   create TCB  |     | delete TCB         \   \
//!                               V     |                      \   \
//!           rcv RST (note 1)  +---------+            CLOSE    |    \
//!        -------------------->|  LISTEN |          ---------- |     |
//!       /                     +---------+          delete TCB |     |
//!      /           rcv SYN      |     |     SEND              |     |
//!     /           -----------   |     |    -------            |     V
//! +--------+      snd SYN,ACK  /       \   snd SYN          +--------+
//! |        |<-----------------           ------------------>|        |
//! |  SYN   |                    rcv SYN                     |  SYN   |
//! |  RCVD  |<-----------------------------------------------|  SENT  |
//! |        |                  snd SYN,ACK                   |        |
//! |        |------------------           -------------------|        |
//! +--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
//!    |         --------------   |     |   -----------
//!    |                x         |     |     snd ACK
//!    |                          V     V
//!    |  CLOSE                 +---------+
//!    | -------                |  ESTAB  |
//!    | snd FIN                +---------+
//!    |                 CLOSE    |     |    rcv FIN
//!    V                -------   |     |    -------
//! +---------+         snd FIN  /       \   snd ACK         +---------+
//! |  FIN    |<----------------          ------------------>|  CLOSE  |
//! | WAIT-1  |------------------                            |   WAIT  |
//! +---------+          rcv FIN  \                          +---------+
//!   | rcv ACK of FIN   -------   |                          CLOSE  |
//!   | --------------   snd ACK   |                         ------- |
//!   V        x                   V                         snd FIN V
//! +---------+               +---------+                    +---------+
//! |FINWAIT-2|               | CLOSING |                    | LAST-ACK|
//! +---------+               +---------+                    +---------+
//!   |              rcv ACK of FIN |                 rcv ACK of FIN |
//!   |  rcv FIN     -------------- |    Timeout      -------------- |
//!   |  -------            x       V    ------------        x       V
//!    \ snd ACK              +---------+delete TCB          +---------+
//!      -------------------->|TIME-WAIT|------------------->| CLOSED  |
//!                           +---------+                    +---------+
//! ```
//!
//! This table is a direct transliteration of the `automat.MethodicalMachine`
//! transitions in the reference implementation's `tcpdfa` module, which is
//! itself a transcription of the diagram above.

/// The state of a connection's protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Inputs the state machine reacts to. Distinct from the raw packet flags:
/// several packet shapes (e.g. `ACK` alone vs. `FIN+ACK`) are folded into a
/// single input because the reference automaton treats them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    /// The application asked to open a connection (`connect`).
    ActiveOpen,
    /// The multiplexer synthesized a connection for an inbound bare SYN.
    PassiveOpen,
    /// A SYN arrived (no ACK).
    Syn,
    /// A SYN+ACK arrived.
    SynAck,
    /// A pure ACK arrived (acknowledging something other than a FIN).
    Ack,
    /// An ACK arrived that acknowledges our outstanding FIN.
    AckOfFin,
    /// A FIN arrived.
    Fin,
    /// A RST arrived.
    Rst,
    /// The application asked to close the connection (`lose_connection`).
    Close,
    /// The 2MSL TIME-WAIT timer expired.
    TimeWaitTimeout,
    /// The retransmission retry budget was spent without an ACK covering
    /// the outstanding segments.
    Timeout,
}

/// Outputs the state machine requests of the connection engine. These are
/// advisory. The engine decides exactly which bytes/sequence numbers go on
/// the wire; the state machine only says which control bits to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    SendSyn,
    SendSynAck,
    SendAck,
    SendFin,
    SendRst,
    StartTimeWaitTimer,
    DeleteTcb,
    None,
}

/// The result of a table lookup: the state to move to, and what the
/// connection engine should do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub output: Output,
}

impl Transition {
    fn to(next: State, output: Output) -> Self {
        Self { next, output }
    }
}

impl State {
    /// Look up the transition for `input` in the current state.
    ///
    /// Returns `None` when this (state, input) pair is one the protocol
    /// simply ignores, a stray SYN retransmission arriving after the
    /// connection has reached `Established`, for instance. Combinations
    /// that can never legitimately occur (e.g. `ActiveOpen` while already
    /// `Established`) are programming errors in the connection engine, not
    /// protocol conditions, and are reported with `unreachable!` instead.
    pub fn on(self, input: Input) -> Option<Transition> {
        use Input::*;
        use Output::*;
        use State::*;

        Some(match (self, input) {
            (Closed, ActiveOpen) => Transition::to(SynSent, SendSyn),
            (Closed, PassiveOpen) => Transition::to(Listen, None),
            (Closed, _) => return None,

            (Listen, Syn) => Transition::to(SynReceived, SendSynAck),
            (Listen, Close) => Transition::to(Closed, DeleteTcb),
            (Listen, _) => return None,

            (SynSent, SynAck) => Transition::to(Established, SendAck),
            (SynSent, Syn) => Transition::to(SynReceived, SendSynAck),
            (SynSent, Rst) => Transition::to(Closed, DeleteTcb),
            (SynSent, Close) => Transition::to(Closed, DeleteTcb),
            // No RST: the peer never answered, there's nothing to tear down
            // on the wire, only the local attempt to report as failed.
            (SynSent, Timeout) => Transition::to(Closed, DeleteTcb),
            (SynSent, _) => return None,

            (SynReceived, Ack) => Transition::to(Established, None),
            (SynReceived, Rst) => Transition::to(Closed, DeleteTcb),
            (SynReceived, Close) => Transition::to(FinWait1, SendFin),
            // The peer's final ACK of the handshake never arrived; unlike
            // SynSent or Established, there's a half-open TCB on the wire
            // worth resetting.
            (SynReceived, Timeout) => Transition::to(Closed, SendRst),
            (SynReceived, _) => return None,

            (Established, Close) => Transition::to(FinWait1, SendFin),
            (Established, Fin) => Transition::to(CloseWait, SendAck),
            (Established, Rst) => Transition::to(Closed, DeleteTcb),
            (Established, Timeout) => Transition::to(Closed, DeleteTcb),
            (Established, _) => return None,

            (FinWait1, AckOfFin) => Transition::to(FinWait2, None),
            (FinWait1, Fin) => Transition::to(Closing, SendAck),
            // Simultaneous close: our FIN is acked in the same segment that
            // carries the peer's FIN.
            (FinWait1, Rst) => Transition::to(Closed, DeleteTcb),
            (FinWait1, Timeout) => Transition::to(Closed, DeleteTcb),
            (FinWait1, _) => return None,

            (FinWait2, Fin) => Transition::to(TimeWait, SendAck),
            (FinWait2, Rst) => Transition::to(Closed, DeleteTcb),
            (FinWait2, Timeout) => Transition::to(Closed, DeleteTcb),
            (FinWait2, _) => return None,

            (CloseWait, Close) => Transition::to(LastAck, SendFin),
            (CloseWait, Rst) => Transition::to(Closed, DeleteTcb),
            (CloseWait, Timeout) => Transition::to(Closed, DeleteTcb),
            (CloseWait, _) => return None,

            (Closing, AckOfFin) => Transition::to(TimeWait, None),
            (Closing, Rst) => Transition::to(Closed, DeleteTcb),
            (Closing, Timeout) => Transition::to(Closed, DeleteTcb),
            (Closing, _) => return None,

            (LastAck, AckOfFin) => Transition::to(Closed, DeleteTcb),
            (LastAck, Rst) => Transition::to(Closed, DeleteTcb),
            (LastAck, Timeout) => Transition::to(Closed, DeleteTcb),
            (LastAck, _) => return None,

            (TimeWait, TimeWaitTimeout) => Transition::to(Closed, DeleteTcb),
            (TimeWait, Fin) => Transition::to(TimeWait, SendAck),
            (TimeWait, _) => return None,
        })
    }

    /// Whether data the application wrote may still be accepted for sending.
    pub fn can_send(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }

    /// Whether inbound data should still be delivered to the application.
    pub fn can_receive(self) -> bool {
        matches!(self, State::Established | State::FinWait1 | State::FinWait2)
    }

    pub fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Input::*;
    use Output::*;
    use State::*;

    #[test]
    fn three_way_handshake() {
        let mut s = Closed;
        let t = s.on(ActiveOpen).unwrap();
        assert_eq!(t, Transition::to(SynSent, SendSyn));
        s = t.next;

        let t = s.on(SynAck).unwrap();
        assert_eq!(t, Transition::to(Established, SendAck));
        s = t.next;
        assert!(s.is_synchronized());
    }

    #[test]
    fn passive_handshake() {
        let mut s = Closed.on(PassiveOpen).unwrap().next;
        assert_eq!(s, Listen);
        s = s.on(Syn).unwrap().next;
        assert_eq!(s, SynReceived);
        s = s.on(Ack).unwrap().next;
        assert_eq!(s, Established);
    }

    #[test]
    fn active_close_full_teardown() {
        let mut s = Established;
        s = s.on(Close).unwrap().next;
        assert_eq!(s, FinWait1);
        s = s.on(AckOfFin).unwrap().next;
        assert_eq!(s, FinWait2);
        s = s.on(Fin).unwrap().next;
        assert_eq!(s, TimeWait);
        s = s.on(TimeWaitTimeout).unwrap().next;
        assert_eq!(s, Closed);
    }

    #[test]
    fn passive_close() {
        let mut s = Established;
        s = s.on(Fin).unwrap().next;
        assert_eq!(s, CloseWait);
        s = s.on(Close).unwrap().next;
        assert_eq!(s, LastAck);
        s = s.on(AckOfFin).unwrap().next;
        assert_eq!(s, Closed);
    }

    #[test]
    fn simultaneous_close() {
        let mut s = Established.on(Close).unwrap().next;
        assert_eq!(s, FinWait1);
        s = s.on(Fin).unwrap().next;
        assert_eq!(s, Closing);
        s = s.on(AckOfFin).unwrap().next;
        assert_eq!(s, TimeWait);
    }

    #[test]
    fn stray_syn_in_established_is_ignored() {
        assert!(Established.on(Syn).is_none());
    }

    #[test]
    fn rst_resets_from_any_synchronized_state() {
        for state in [SynReceived, Established, FinWait1, FinWait2, CloseWait, Closing, LastAck] {
            assert_eq!(state.on(Rst), Some(Transition::to(Closed, DeleteTcb)));
        }
    }
}
