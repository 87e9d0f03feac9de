//! Packet continuity bookkeeping

use tracing::trace;

/// How a packet's sequence number related to the one we expected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Hit,
    /// Arrived after a later packet, or a duplicate
    Delayed,
    /// Skipped over this many packets
    Miss(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    pub expected_next: u32,
    pub hit_count: u64,
    pub miss_count: u64,
    pub delayed_count: u64,
    /// Sample index of the first sample of the next block
    pub total_samples_emitted: i64,
    /// Most recent sequence number seen
    pub last_sequence: u32,
}

/// Classifies consecutive sequence numbers for one acquisition session.
///
/// Out of order packets resynchronize the cursor instead of being rejected. Sample
/// indices follow the sequence number, so lost packets leave gaps in them.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    samples_per_packet: usize,
    state: SequenceState,
}

impl SequenceTracker {
    pub fn new(samples_per_packet: usize) -> Self {
        Self {
            samples_per_packet,
            state: SequenceState::default(),
        }
    }

    pub fn reset(&mut self) {
        self.state = SequenceState::default();
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    /// Record sequence number `seq`, returning how it arrived and the first
    /// sample index of the packet's block
    pub fn observe(&mut self, seq: u32) -> (Arrival, i64) {
        let s = &mut self.state;
        let e = s.expected_next;
        let arrival = if e == 0 || seq == e {
            s.hit_count += 1;
            Arrival::Hit
        } else if seq < e {
            s.delayed_count += 1;
            trace!(seq, expected = e, "Delayed packet");
            Arrival::Delayed
        } else {
            let gap = seq - e;
            s.miss_count += gap as u64;
            trace!(seq, expected = e, gap, "Missed packets");
            Arrival::Miss(gap)
        };
        s.expected_next = seq.wrapping_add(1);
        s.last_sequence = seq;
        let first_sample = s.total_samples_emitted;
        s.total_samples_emitted = self.samples_per_packet as i64 * seq as i64;
        (arrival, first_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(seqs: &[u32]) -> SequenceState {
        let mut t = SequenceTracker::new(21);
        for &s in seqs {
            t.observe(s);
        }
        *t.state()
    }

    #[test]
    fn test_contiguous() {
        let s = run(&[1, 2, 3]);
        assert_eq!((s.hit_count, s.miss_count, s.delayed_count), (3, 0, 0));
        assert_eq!(s.expected_next, 4);
    }

    #[test]
    fn test_gap_counts_misses() {
        let s = run(&[1, 3]);
        assert_eq!((s.hit_count, s.miss_count, s.delayed_count), (1, 1, 0));
        assert_eq!(s.expected_next, 4);
    }

    #[test]
    fn test_out_of_order_resyncs() {
        let mut t = SequenceTracker::new(21);
        assert_eq!(t.observe(5).0, Arrival::Hit);
        assert_eq!(t.state().expected_next, 6);
        assert_eq!(t.observe(3).0, Arrival::Delayed);
        let s = t.state();
        assert_eq!((s.hit_count, s.delayed_count), (1, 1));
        assert_eq!(s.expected_next, 4);
    }

    #[test]
    fn test_sample_index_jumps_over_gaps() {
        let mut t = SequenceTracker::new(21);
        assert_eq!(t.observe(1).1, 0);
        assert_eq!(t.observe(2).1, 21);
        assert_eq!(t.observe(5).1, 42);
        assert_eq!(t.observe(6).1, 105);
    }

    #[test]
    fn test_reset() {
        let mut t = SequenceTracker::new(21);
        t.observe(7);
        t.reset();
        assert_eq!(*t.state(), SequenceState::default());
        assert_eq!(t.observe(100).0, Arrival::Hit);
    }
}
