//! Sliding-window send state for the two retransmission disciplines.
//!
//! [`SendWindow`] only manages state; all socket I/O is the caller's
//! responsibility. `on_nack` returns the encoded packets to put back on the
//! wire, in ascending sequence order.
//!
//! ```text
//!    base             next_seq
//!      │                  │
//!  ────┼──────────────────┼────────▶ seq space
//!      │ <── buffered ──▶ │
//! ```
//!
//! Go-Back-N treats an ACK as cumulative and a NACK as a trigger to resend
//! the whole buffered range. Selective Repeat acknowledges individual
//! sequences and resends only the NACKed one.

use std::collections::{BTreeMap, HashSet};

use crate::handshake::Protocol;

#[derive(Debug)]
pub struct SendWindow {
    protocol: Protocol,
    window_size: usize,
    base: u16,
    next_seq: u16,
    buffer: BTreeMap<u16, Vec<u8>>,
    acked: HashSet<u16>,
}

impl SendWindow {
    pub fn new(protocol: Protocol, window_size: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            protocol,
            window_size,
            base: 0,
            next_seq: 0,
            buffer: BTreeMap::new(),
            acked: HashSet::new(),
        }
    }

    /// Back to the state of a fresh window. Called at the start of every
    /// outbound message; sequence numbers restart at zero.
    pub fn reset(&mut self) {
        self.base = 0;
        self.next_seq = 0;
        self.buffer.clear();
        self.acked.clear();
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    pub fn in_flight(&self) -> usize {
        self.buffer.len()
    }

    pub fn can_send(&self) -> bool {
        self.in_flight() < self.window_size
    }

    /// Buffer a just-transmitted packet under its sequence number.
    pub fn record_sent(&mut self, sequence: u16, encoded: Vec<u8>) {
        self.buffer.insert(sequence, encoded);
        if sequence >= self.next_seq {
            self.next_seq = sequence + 1;
        }
    }

    /// `true` once `sequence` has been acknowledged under the active
    /// discipline.
    pub fn is_acked(&self, sequence: u16) -> bool {
        sequence < self.base
            || (self.protocol == Protocol::Sr && self.acked.contains(&sequence))
    }

    pub fn on_ack(&mut self, sequence: u16) {
        match self.protocol {
            Protocol::Gbn => {
                // Stale ACK from before the current base.
                if sequence < self.base {
                    return;
                }
                let old_base = self.base;
                self.base = sequence + 1;
                for seq in old_base..self.base {
                    self.buffer.remove(&seq);
                }
            }
            Protocol::Sr => {
                self.acked.insert(sequence);
                while self.acked.remove(&self.base) {
                    self.buffer.remove(&self.base);
                    self.base += 1;
                }
            }
        }
    }

    /// Packets to retransmit in response to a NACK, ascending by sequence.
    pub fn on_nack(&self, sequence: u16) -> Vec<(u16, Vec<u8>)> {
        match self.protocol {
            Protocol::Gbn => self
                .buffer
                .range(self.base..self.next_seq)
                .map(|(seq, bytes)| (*seq, bytes.clone()))
                .collect(),
            Protocol::Sr => self
                .buffer
                .get(&sequence)
                .map(|bytes| vec![(sequence, bytes.clone())])
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_window(protocol: Protocol) -> SendWindow {
        let mut window = SendWindow::new(protocol, 4);
        for seq in 0..4u16 {
            window.record_sent(seq, vec![seq as u8]);
        }
        window
    }

    #[test]
    fn record_sent_advances_next_seq() {
        let mut window = SendWindow::new(Protocol::Gbn, 4);
        assert!(window.can_send());
        window.record_sent(0, vec![0]);
        window.record_sent(1, vec![1]);
        assert_eq!(window.next_seq(), 2);
        assert_eq!(window.base(), 0);
        assert_eq!(window.in_flight(), 2);
    }

    #[test]
    fn window_full_blocks_send() {
        let window = filled_window(Protocol::Gbn);
        assert!(!window.can_send());
    }

    #[test]
    fn gbn_cumulative_ack_slides_base() {
        let mut window = filled_window(Protocol::Gbn);
        window.on_ack(2);
        assert_eq!(window.base(), 3);
        assert_eq!(window.in_flight(), 1);
        assert!(window.is_acked(0));
        assert!(window.is_acked(2));
        assert!(!window.is_acked(3));
    }

    #[test]
    fn gbn_stale_ack_is_ignored() {
        let mut window = filled_window(Protocol::Gbn);
        window.on_ack(2);
        window.on_ack(0);
        assert_eq!(window.base(), 3);
    }

    #[test]
    fn gbn_nack_retransmits_whole_unacked_range_in_order() {
        let mut window = filled_window(Protocol::Gbn);
        window.on_ack(0);

        let retransmit = window.on_nack(1);
        let sequences: Vec<u16> = retransmit.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        // Base does not move until the ACK arrives.
        assert_eq!(window.base(), 1);
        window.on_ack(1);
        assert_eq!(window.base(), 2);
    }

    #[test]
    fn sr_nack_retransmits_only_that_sequence() {
        let mut window = filled_window(Protocol::Sr);
        window.on_ack(0);

        let retransmit = window.on_nack(1);
        assert_eq!(retransmit.len(), 1);
        assert_eq!(retransmit[0].0, 1);
    }

    #[test]
    fn sr_out_of_order_ack_holds_base_then_slides() {
        let mut window = filled_window(Protocol::Sr);
        window.on_ack(0);
        assert_eq!(window.base(), 1);

        // ACK(2) before ACK(1): marked, but base stays put.
        window.on_ack(2);
        assert!(window.is_acked(2));
        assert_eq!(window.base(), 1);

        // ACK(1) arrives: base slides across the acked run 1..=2.
        window.on_ack(1);
        assert_eq!(window.base(), 3);
        assert_eq!(window.in_flight(), 1);
    }

    #[test]
    fn sr_nack_for_evicted_sequence_is_empty() {
        let mut window = filled_window(Protocol::Sr);
        window.on_ack(0);
        assert!(window.on_nack(0).is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut window = filled_window(Protocol::Sr);
        window.on_ack(1);
        window.reset();
        assert_eq!(window.base(), 0);
        assert_eq!(window.next_seq(), 0);
        assert_eq!(window.in_flight(), 0);
        assert!(!window.is_acked(1));
    }
}
