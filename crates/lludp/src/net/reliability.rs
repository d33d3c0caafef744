use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::config::ReliabilityConfig;
use super::protocol::{MAX_APPENDED_ACKS, set_resend_flag};

const RECENT_WINDOW: usize = 256;

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub sequence: u32,
    pub bytes: Vec<u8>,
    pub sent_at: Instant,
    pub retry_count: u32,
    timeout: Duration,
}

impl PendingAck {
    fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) >= self.timeout
    }
}

/// Output of one retransmission pass.
#[derive(Debug, Default, PartialEq)]
pub struct RetransmitBatch {
    /// Serialized packets with the resend flag set, in sequence order.
    pub resend: Vec<Vec<u8>>,
    /// Sequences whose retry budget ran out.
    pub expired: Vec<u32>,
}

impl RetransmitBatch {
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.expired.is_empty()
    }
}

/// Outbound half: sequence assignment and retransmission of reliable
/// packets until acknowledged.
#[derive(Debug)]
pub struct ReliabilityLayer {
    config: ReliabilityConfig,
    pending: VecDeque<PendingAck>,
    evicted: Vec<u32>,
    next_sequence: u32,
    srtt: Option<f32>,
    rtt_var: f32,
}

impl ReliabilityLayer {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(config.max_pending.min(1024)),
            config,
            evicted: Vec::new(),
            next_sequence: 1,
            srtt: None,
            rtt_var: 0.0,
        }
    }

    /// Hands out sequence numbers in send order, skipping zero on wrap.
    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        sequence
    }

    pub fn on_send(&mut self, sequence: u32, bytes: Vec<u8>, reliable: bool, now: Instant) {
        if !reliable {
            return;
        }

        if self.pending.len() >= self.config.max_pending {
            if let Some(oldest) = self.pending.pop_front() {
                log::warn!(
                    "Pending ack table full, giving up on sequence {}",
                    oldest.sequence
                );
                self.evicted.push(oldest.sequence);
            }
        }

        self.pending.push_back(PendingAck {
            sequence,
            bytes,
            sent_at: now,
            retry_count: 0,
            timeout: self.config.initial_timeout,
        });
    }

    pub fn on_ack_received(&mut self, sequence: u32) -> bool {
        self.on_ack_received_at(sequence, Instant::now())
    }

    /// Clears a pending entry. Unknown or already cleared sequences are
    /// ignored and return false.
    pub fn on_ack_received_at(&mut self, sequence: u32, now: Instant) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.sequence == sequence) else {
            return false;
        };

        if let Some(entry) = self.pending.remove(index) {
            // Retransmitted packets give ambiguous samples.
            if entry.retry_count == 0 {
                let rtt = now.saturating_duration_since(entry.sent_at).as_secs_f32() * 1000.0;
                self.update_rtt(rtt);
            }
        }
        true
    }

    pub fn tick(&mut self, now: Instant) -> RetransmitBatch {
        let mut batch = RetransmitBatch {
            expired: std::mem::take(&mut self.evicted),
            ..Default::default()
        };

        let max_retries = self.config.max_retries;
        let max_timeout = self.config.max_timeout;
        self.pending.retain_mut(|entry| {
            if !entry.due(now) {
                return true;
            }
            if entry.retry_count >= max_retries {
                batch.expired.push(entry.sequence);
                return false;
            }

            entry.retry_count += 1;
            entry.sent_at = now;
            entry.timeout = (entry.timeout * 2).min(max_timeout);
            set_resend_flag(&mut entry.bytes);
            batch.resend.push(entry.bytes.clone());
            true
        });

        batch
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rtt_var = rtt / 2.0;
            }
            Some(srtt) => {
                let diff = (rtt - srtt).abs();
                self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * rtt);
            }
        }
    }

    pub fn srtt(&self) -> Option<f32> {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn oldest_unacked(&self) -> Option<u32> {
        self.pending.front().map(|p| p.sequence)
    }

    pub fn is_pending(&self, sequence: u32) -> bool {
        self.pending.iter().any(|p| p.sequence == sequence)
    }

    /// Drops every pending entry without reporting them.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.evicted.clear();
    }
}

/// Inbound half: duplicate detection and the queue of sequences we owe
/// the simulator an acknowledgement for.
#[derive(Debug)]
pub struct ReceiveTracker {
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
    owed_acks: Vec<u32>,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            recent_sequences: VecDeque::with_capacity(RECENT_WINDOW),
            max_recent: RECENT_WINDOW,
            owed_acks: Vec::new(),
        }
    }

    /// Returns false for a reliable sequence seen within the recent window.
    /// Reliable packets are queued for acknowledgement either way, since the
    /// peer resends when our earlier ack was lost. Unreliable packets are
    /// never resent, so they stay out of the window and cannot push a
    /// reliable sequence out of it.
    pub fn record_received(&mut self, sequence: u32, reliable: bool) -> bool {
        if !reliable {
            return true;
        }

        if !self.owed_acks.contains(&sequence) {
            self.owed_acks.push(sequence);
        }

        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);
        true
    }

    pub fn owed_count(&self) -> usize {
        self.owed_acks.len()
    }

    /// Removes up to one packet's worth of owed acks, oldest first.
    pub fn take_acks(&mut self) -> Vec<u32> {
        let count = self.owed_acks.len().min(MAX_APPENDED_ACKS);
        self.owed_acks.drain(..count).collect()
    }

    /// Puts acks back at the front after a failed send.
    pub fn requeue_acks(&mut self, acks: Vec<u32>) {
        let mut owed = acks;
        owed.retain(|sequence| !self.owed_acks.contains(sequence));
        owed.append(&mut self.owed_acks);
        self.owed_acks = owed;
    }

    pub fn clear(&mut self) {
        self.recent_sequences.clear();
        self.owed_acks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::PacketFlags;

    fn layer() -> ReliabilityLayer {
        ReliabilityLayer::new(ReliabilityConfig::default())
    }

    #[test]
    fn test_sequences_are_monotonic_and_skip_zero() {
        let mut layer = layer();
        assert_eq!(layer.next_sequence(), 1);
        assert_eq!(layer.next_sequence(), 2);

        layer.next_sequence = u32::MAX;
        assert_eq!(layer.next_sequence(), u32::MAX);
        assert_eq!(layer.next_sequence(), 1);
    }

    #[test]
    fn test_unreliable_send_is_not_tracked() {
        let mut layer = layer();
        layer.on_send(1, vec![0; 10], false, Instant::now());
        assert_eq!(layer.pending_count(), 0);
    }

    #[test]
    fn test_ack_clears_pending() {
        let mut layer = layer();
        let start = Instant::now();
        layer.on_send(1, vec![0x40; 10], true, start);
        layer.on_send(2, vec![0x40; 10], true, start);
        assert_eq!(layer.oldest_unacked(), Some(1));

        assert!(layer.on_ack_received_at(1, start + Duration::from_millis(40)));
        assert!(!layer.on_ack_received_at(1, start + Duration::from_millis(41)));
        assert!(!layer.on_ack_received_at(99, start));
        assert_eq!(layer.pending_count(), 1);
        assert_eq!(layer.oldest_unacked(), Some(2));
        let srtt = layer.srtt().unwrap();
        assert!((srtt - 40.0).abs() < 0.01);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut layer = layer();
        let start = Instant::now();
        layer.on_send(7, vec![0x40, 0, 0, 0, 7], true, start);

        assert!(layer.tick(start + Duration::from_millis(499)).is_empty());

        let batch = layer.tick(start + Duration::from_millis(500));
        assert_eq!(batch.resend.len(), 1);
        assert_ne!(batch.resend[0][0] & PacketFlags::RESEND.bits(), 0);

        // Next timeout is one second after the resend.
        assert!(layer.tick(start + Duration::from_millis(1499)).is_empty());
        assert_eq!(layer.tick(start + Duration::from_millis(1500)).resend.len(), 1);
    }

    #[test]
    fn test_retry_budget_then_expiry() {
        let mut layer = layer();
        let start = Instant::now();
        layer.on_send(3, vec![0x40; 12], true, start);

        let mut resends = 0;
        let mut expired = Vec::new();
        let mut now = start;
        while now < start + Duration::from_secs(60) {
            now += Duration::from_millis(100);
            let batch = layer.tick(now);
            resends += batch.resend.len();
            expired.extend(batch.expired);
        }

        assert_eq!(resends, 5);
        assert_eq!(expired, vec![3]);
        assert_eq!(layer.pending_count(), 0);
    }

    #[test]
    fn test_retransmitted_ack_skips_rtt_sample() {
        let mut layer = layer();
        let start = Instant::now();
        layer.on_send(1, vec![0x40; 9], true, start);
        layer.tick(start + Duration::from_millis(600));
        assert!(layer.on_ack_received_at(1, start + Duration::from_millis(700)));
        assert_eq!(layer.srtt(), None);
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut layer = ReliabilityLayer::new(ReliabilityConfig {
            max_pending: 2,
            ..Default::default()
        });
        let now = Instant::now();
        layer.on_send(1, vec![0x40], true, now);
        layer.on_send(2, vec![0x40], true, now);
        layer.on_send(3, vec![0x40], true, now);

        assert_eq!(layer.pending_count(), 2);
        assert_eq!(layer.tick(now).expired, vec![1]);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1, true));
        assert!(!tracker.record_received(1, true));
        assert!(tracker.record_received(2, false));

        // The duplicate is owed a single ack, not two.
        assert_eq!(tracker.take_acks(), vec![1]);
        assert_eq!(tracker.owed_count(), 0);
    }

    #[test]
    fn test_unreliable_traffic_does_not_evict_reliable_sequences() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(1, true));
        for sequence in 2..(2 + 2 * RECENT_WINDOW as u32) {
            assert!(tracker.record_received(sequence, false));
        }

        assert!(!tracker.record_received(1, true));
        assert_eq!(tracker.take_acks(), vec![1]);
    }

    #[test]
    fn test_out_of_order_is_accepted() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(3, true));
        assert!(tracker.record_received(1, true));
        assert!(tracker.record_received(2, true));
        assert_eq!(tracker.take_acks(), vec![3, 1, 2]);
    }

    #[test]
    fn test_take_acks_is_bounded() {
        let mut tracker = ReceiveTracker::new();
        for sequence in 0..300 {
            tracker.record_received(sequence, true);
        }
        assert_eq!(tracker.take_acks().len(), MAX_APPENDED_ACKS);
        assert_eq!(tracker.take_acks().len(), 300 - MAX_APPENDED_ACKS);
        assert!(tracker.take_acks().is_empty());
    }
}
