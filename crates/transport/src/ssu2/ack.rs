//! Receive-side packet tracking and the compact ack encoding.
//!
//! The receiver keeps the highest strictly in-order packet number plus a
//! set of out-of-sequence numbers. Acks carry `ackThrough` (highest seen),
//! `acnt` (contiguous run below it) and up to 32 `{nack-run, ack-run}` byte
//! pairs walking downward, covering at most 511 packets.

use std::collections::BTreeSet;

use super::block::Block;
use super::{SSU2_MAX_NUM_ACK_PACKETS, SSU2_MAX_NUM_ACK_RANGES, SSU2_MAX_NUM_ACNT};

#[derive(Debug, PartialEq, Eq)]
pub enum Insert {
    /// Fresh packet, advance state.
    New,
    /// Already seen; resend of something we acked.
    Duplicate,
}

pub struct AckTracker {
    /// Every packet `<= receive_packet_num` has been received.
    receive_packet_num: u32,
    out_of_sequence: BTreeSet<u32>,
}

impl AckTracker {
    /// Packet number 0 is the handshake packet, counted as received.
    pub fn new() -> Self {
        Self {
            receive_packet_num: 0,
            out_of_sequence: BTreeSet::new(),
        }
    }

    pub fn receive_packet_num(&self) -> u32 {
        self.receive_packet_num
    }

    pub fn insert(&mut self, packet_num: u32) -> Insert {
        if packet_num <= self.receive_packet_num {
            return Insert::Duplicate;
        }
        if packet_num == self.receive_packet_num + 1 {
            self.receive_packet_num = packet_num;
            // absorb any run that became contiguous
            while self
                .out_of_sequence
                .remove(&(self.receive_packet_num + 1))
            {
                self.receive_packet_num += 1;
            }
            Insert::New
        } else if self.out_of_sequence.insert(packet_num) {
            Insert::New
        } else {
            Insert::Duplicate
        }
    }

    /// Highest packet number seen at all.
    pub fn ack_through(&self) -> u32 {
        self.out_of_sequence
            .iter()
            .next_back()
            .copied()
            .unwrap_or(self.receive_packet_num)
    }

    /// Build the ack block for the current state.
    pub fn build_ack(&self) -> Block {
        let ack_through = self.ack_through();
        let mut acnt = 0u32;
        let mut ranges: Vec<(u8, u8)> = Vec::new();

        // walk the received set downward from ack_through
        let mut cursor = ack_through;
        let mut total: u32 = 1; // ack_through itself
        let received = |n: u32| n <= self.receive_packet_num || self.out_of_sequence.contains(&n);

        // acnt: contiguous run right below ack_through
        while cursor > 0 && acnt < SSU2_MAX_NUM_ACNT && total < SSU2_MAX_NUM_ACK_PACKETS {
            if received(cursor - 1) {
                acnt += 1;
                total += 1;
                cursor -= 1;
            } else {
                break;
            }
        }

        // ranges: alternating nack/ack runs
        while cursor > 0
            && ranges.len() < SSU2_MAX_NUM_ACK_RANGES
            && total < SSU2_MAX_NUM_ACK_PACKETS
        {
            let mut nacks = 0u32;
            while cursor > 0 && !received(cursor - 1) && nacks < SSU2_MAX_NUM_ACNT {
                nacks += 1;
                cursor -= 1;
            }
            let mut acks = 0u32;
            while cursor > 0
                && received(cursor - 1)
                && acks < SSU2_MAX_NUM_ACNT
                && total < SSU2_MAX_NUM_ACK_PACKETS
            {
                acks += 1;
                total += 1;
                cursor -= 1;
            }
            if nacks == 0 && acks == 0 {
                break;
            }
            ranges.push((nacks as u8, acks as u8));
        }

        Block::Ack {
            ack_through,
            acnt: acnt as u8,
            ranges,
        }
    }

    /// The packet numbers an ack block covers as received.
    pub fn acked_packets(ack_through: u32, acnt: u8, ranges: &[(u8, u8)]) -> Vec<u32> {
        let mut acked = Vec::new();
        acked.push(ack_through);
        let mut cursor = ack_through;
        for _ in 0..acnt {
            if cursor == 0 {
                return acked;
            }
            cursor -= 1;
            acked.push(cursor);
        }
        for (nacks, acks) in ranges {
            if cursor < *nacks as u32 {
                return acked;
            }
            cursor -= *nacks as u32;
            for _ in 0..*acks {
                if cursor == 0 {
                    return acked;
                }
                cursor -= 1;
                acked.push(cursor);
            }
        }
        acked
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn coverage(block: &Block) -> HashSet<u32> {
        let Block::Ack {
            ack_through,
            acnt,
            ranges,
        } = block
        else {
            panic!("not an ack block");
        };
        AckTracker::acked_packets(*ack_through, *acnt, ranges)
            .into_iter()
            .collect()
    }

    #[test]
    fn test_in_order_stream() {
        let mut tracker = AckTracker::new();
        for n in 1..=5 {
            assert_eq!(tracker.insert(n), Insert::New);
        }
        assert_eq!(tracker.receive_packet_num(), 5);
        let Block::Ack {
            ack_through,
            acnt,
            ranges,
        } = tracker.build_ack()
        else {
            unreachable!()
        };
        assert_eq!(ack_through, 5);
        assert_eq!(acnt, 5);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_duplicates_detected() {
        let mut tracker = AckTracker::new();
        assert_eq!(tracker.insert(1), Insert::New);
        assert_eq!(tracker.insert(1), Insert::Duplicate);
        assert_eq!(tracker.insert(0), Insert::Duplicate);
        assert_eq!(tracker.insert(5), Insert::New);
        assert_eq!(tracker.insert(5), Insert::Duplicate);
    }

    #[test]
    fn test_gap_absorption() {
        let mut tracker = AckTracker::new();
        tracker.insert(2);
        tracker.insert(3);
        assert_eq!(tracker.receive_packet_num(), 0);
        tracker.insert(1);
        assert_eq!(tracker.receive_packet_num(), 3);
    }

    #[test]
    fn test_loss_scenario_coverage() {
        // 32 packets, 10 and 20 lost: the ack covers exactly the union of
        // received numbers with no duplicates.
        let mut tracker = AckTracker::new();
        for n in 1..=32u32 {
            if n != 10 && n != 20 {
                tracker.insert(n);
            }
        }
        let block = tracker.build_ack();
        let Block::Ack {
            ack_through, acnt, ..
        } = &block
        else {
            unreachable!()
        };
        assert_eq!(*ack_through, 32);
        assert_eq!(*acnt, 11); // 31..21 contiguous below 32

        let covered = coverage(&block);
        let expected: HashSet<u32> = (0..=32).filter(|n| *n != 10 && *n != 20).collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn test_acked_packets_walks_ranges() {
        let acked = AckTracker::acked_packets(32, 11, &[(1, 9), (1, 10)]);
        let set: HashSet<u32> = acked.iter().copied().collect();
        assert_eq!(set.len(), acked.len(), "no duplicates");
        assert!(set.contains(&32));
        assert!(set.contains(&21));
        assert!(!set.contains(&20));
        assert!(set.contains(&11));
        assert!(!set.contains(&10));
        assert!(set.contains(&9));
        assert!(set.contains(&0));
    }

    #[test]
    fn test_range_cap() {
        // alternate received/lost to force many ranges
        let mut tracker = AckTracker::new();
        for n in (2..400u32).step_by(2) {
            tracker.insert(n);
        }
        let Block::Ack { ranges, .. } = tracker.build_ack() else {
            unreachable!()
        };
        assert!(ranges.len() <= SSU2_MAX_NUM_ACK_RANGES);
    }
}
