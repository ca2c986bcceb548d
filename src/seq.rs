//! Sequence-space arithmetic: modular comparisons and the acceptability
//! tests a connection uses to decide whether an incoming segment or ACK
//! belongs in its window.
//!
//! Sequence numbers live on the wire as a single `u32` ring, the same
//! constraint RFC 793 places on TCP. A [`crate::connection::Connection`]
//! additionally tracks how many times that ring has wrapped (its "lap")
//! since the connection's initial sequence number, so it can hand the
//! application a monotonically increasing byte offset; the comparisons
//! below don't need to know about laps at all, since two numbers at most
//! half the ring apart compare the same way whether or not a wrap occurred
//! between them.

/// a < b under modular arithmetic on the 32-bit sequence ring.
pub fn mod_lt(a: u32, b: u32) -> bool {
    // k sits on the opposite side of the ring from b. Splitting the ring at
    // k and comparing a and b's position relative to it disambiguates which
    // direction is "less than" even across a wraparound.
    let k = b.wrapping_add(u32::MAX / 2);
    (a < b) ^ (a < k) ^ (b < k)
}

/// a <= b under modular arithmetic.
pub fn mod_leq(a: u32, b: u32) -> bool {
    mod_lt(a, b.wrapping_add(1))
}

/// a > b under modular arithmetic.
pub fn mod_gt(a: u32, b: u32) -> bool {
    mod_lt(b, a)
}

/// a >= b under modular arithmetic.
pub fn mod_geq(a: u32, b: u32) -> bool {
    mod_leq(b, a)
}

/// Which edge comparison a [`mod_bounded`] bound uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Strict: the edge value itself is excluded.
    Lt,
    /// Inclusive: the edge value itself is included.
    Leq,
}

use Bound::*;

impl Bound {
    fn offset(self) -> u32 {
        match self {
            Lt => 0,
            Leq => 1,
        }
    }
}

/// Is `b` within the modular range `(a, c)`, with each edge either strict
/// or inclusive as given by `lo`/`hi`?
pub fn mod_bounded(a: u32, lo: Bound, b: u32, hi: Bound, c: u32) -> bool {
    let a = a.wrapping_sub(lo.offset());
    let c = c.wrapping_add(hi.offset());

    // a < b < c holds in exactly one of three rotations of the ring:
    let j = a < b && b < c && a < c;
    let k = a < b && b > c && a > c;
    let l = a > b && b < c && a > c;
    j || k || l
}

/// RFC 793 page 26's `SEG.SEQ` acceptability test, restated for PTCP: is an
/// incoming segment's sequence range at least partially inside the receive
/// window?
///
/// `seg_len` is the segment length as defined in spec.md §4.2 (payload
/// length, plus one for SYN or FIN if present). A zero-length segment to a
/// zero-length window is only acceptable if its sequence number is exactly
/// `rcv_nxt`.
pub fn segment_acceptable(seg_seq: u32, seg_len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    if seg_len == 0 && rcv_wnd == 0 {
        return seg_seq == rcv_nxt;
    }
    if seg_len == 0 {
        return mod_bounded(rcv_nxt.wrapping_sub(1), Lt, seg_seq, Lt, rcv_nxt.wrapping_add(rcv_wnd));
    }
    if rcv_wnd == 0 {
        return false;
    }
    let seg_last = seg_seq.wrapping_add(seg_len - 1);
    let window_end = rcv_nxt.wrapping_add(rcv_wnd);
    mod_bounded(rcv_nxt.wrapping_sub(1), Lt, seg_seq, Lt, window_end)
        || mod_bounded(rcv_nxt.wrapping_sub(1), Lt, seg_last, Lt, window_end)
}

/// RFC 793 page 25's ACK acceptability test: does this ACK cover data we've
/// sent but which hasn't already been acknowledged?
pub fn ack_acceptable(seg_ack: u32, snd_una: u32, snd_nxt: u32) -> bool {
    mod_bounded(snd_una, Lt, seg_ack, Leq, snd_nxt)
}

/// Tracks the number of times the 32-bit sequence ring has wrapped since a
/// connection's initial sequence number, so wire-relative sequence numbers
/// can be converted to an ever-increasing byte offset for logging and for
/// the producer/consumer byte-count API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lap(pub u64);

impl Lap {
    /// Advance the lap counter if `new_nxt` wrapped around past `old_nxt`.
    pub fn advance(&mut self, old_nxt: u32, new_nxt: u32) {
        if new_nxt < old_nxt {
            self.0 += 1;
        }
    }

    /// Express `wire_seq`, relative to `isn`, as a flat `u64` offset that
    /// never wraps, given how many laps have elapsed.
    pub fn relative(self, isn: u32, wire_seq: u32) -> u64 {
        let offset = wire_seq.wrapping_sub(isn) as u64;
        self.0 * (u32::MAX as u64 + 1) + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_comparison() {
        assert!(mod_lt(10, 20));
        assert!(!mod_lt(20, 10));
        assert!(mod_lt(2_000_000_000, 3_000_000_000));
        assert!(!mod_lt(3_000_000_000, 2_000_000_000));
        assert!(mod_lt(3_000_000_000, 4_000_000_000));
        assert!(!mod_lt(4_000_000_000, 3_000_000_000));

        assert!(!mod_lt(5, 5));
        assert!(mod_leq(5, 5));

        assert!(mod_gt(20, 10));
        assert!(!mod_gt(5, 5));
        assert!(mod_geq(5, 5));
    }

    #[test]
    fn bounded_wraps_correctly() {
        assert!(mod_bounded(5, Lt, 10, Lt, 15));
        assert!(!mod_bounded(15, Lt, 10, Lt, 5));

        assert!(mod_bounded(u32::MAX - 5, Lt, 5, Lt, 10));
        assert!(!mod_bounded(10, Lt, 5, Lt, u32::MAX - 5));

        assert!(!mod_bounded(5, Lt, 5, Lt, 15));
        assert!(mod_bounded(5, Leq, 5, Lt, 15));
        assert!(!mod_bounded(5, Lt, 15, Lt, 15));
        assert!(mod_bounded(5, Lt, 15, Leq, 15));
        assert!(mod_bounded(10, Leq, 10, Leq, 10));
    }

    #[test]
    fn segment_acceptable_edges() {
        // Empty segment to an empty window is only acceptable exactly at RCV.NXT.
        assert!(segment_acceptable(100, 0, 100, 0));
        assert!(!segment_acceptable(101, 0, 100, 0));

        // Non-empty segment entirely inside the window.
        assert!(segment_acceptable(100, 10, 100, 50));
        // Segment starting before the window but overlapping it.
        assert!(segment_acceptable(90, 20, 100, 50));
        // Segment entirely past the window.
        assert!(!segment_acceptable(200, 10, 100, 50));
    }

    #[test]
    fn ack_acceptable_window() {
        assert!(ack_acceptable(105, 100, 110));
        assert!(ack_acceptable(110, 100, 110));
        assert!(!ack_acceptable(100, 100, 110));
        assert!(!ack_acceptable(111, 100, 110));
    }

    #[test]
    fn lap_tracks_wraparound() {
        let mut lap = Lap::default();
        lap.advance(u32::MAX - 5, 3);
        assert_eq!(lap.0, 1);
        assert!(lap.relative(0, 3) > u32::MAX as u64);
    }
}
