//! Keepalive PING/PONG bookkeeping with RTT measurement.
//!
//! Each ping carries an 8-byte big-endian sequence number as its payload; the
//! peer echoes it in the pong. A ping that stays unanswered for longer than
//! the grace period marks the connection dead.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Encode a ping sequence number as a frame payload
pub fn ping_payload(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

/// Decode a pong payload; anything not exactly 8 bytes is not ours
pub fn parse_pong(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Per-connection keepalive state
#[derive(Debug, Default)]
pub struct KeepaliveState {
    /// Next sequence number
    next_seq: u64,
    /// Outstanding PING sequence numbers and their send times
    outstanding: BTreeMap<u64, Instant>,
    /// Most recent round trip
    last_rtt: Option<Duration>,
}

impl KeepaliveState {
    /// Record a PING being sent and return its payload
    pub fn record_ping(&mut self, now: Instant) -> Vec<u8> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding.insert(seq, now);
        ping_payload(seq)
    }

    /// Process a PONG and return RTT if the sequence number was found.
    ///
    /// A pong also settles every older ping: the link is evidently alive.
    pub fn process_pong(&mut self, payload: &[u8], now: Instant) -> Option<Duration> {
        let seq = parse_pong(payload)?;
        let sent = self.outstanding.remove(&seq)?;
        self.outstanding.retain(|&s, _| s > seq);

        let rtt = now.saturating_duration_since(sent);
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// When the oldest unanswered ping runs out of grace
    pub fn deadline(&self, grace: Duration) -> Option<Instant> {
        self.outstanding.values().min().map(|&sent| sent + grace)
    }

    /// Whether the oldest unanswered ping is past its grace period
    pub fn is_overdue(&self, now: Instant, grace: Duration) -> bool {
        self.deadline(grace).is_some_and(|deadline| now >= deadline)
    }

    /// Number of pings still waiting for a pong
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Most recent round trip time
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_format() {
        assert_eq!(ping_payload(0x0102), vec![0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(parse_pong(&ping_payload(42)), Some(42));
        assert_eq!(parse_pong(b"hello"), None);
        assert_eq!(parse_pong(&[]), None);
    }

    #[test]
    fn test_rtt_calculation() {
        let start = Instant::now();
        let mut state = KeepaliveState::default();

        let payload = state.record_ping(start);
        assert_eq!(state.outstanding(), 1);

        let rtt = state.process_pong(&payload, start + Duration::from_millis(15));
        assert_eq!(rtt, Some(Duration::from_millis(15)));
        assert_eq!(state.last_rtt(), Some(Duration::from_millis(15)));
        assert_eq!(state.outstanding(), 0);

        // Same pong twice is ignored
        assert_eq!(state.process_pong(&payload, start), None);
    }

    #[test]
    fn test_newer_pong_settles_older_pings() {
        let start = Instant::now();
        let mut state = KeepaliveState::default();

        state.record_ping(start);
        let second = state.record_ping(start + Duration::from_millis(10));
        let third = state.record_ping(start + Duration::from_millis(20));

        assert!(state.process_pong(&second, start + Duration::from_millis(25)).is_some());
        assert_eq!(state.outstanding(), 1);
        assert_eq!(
            state.deadline(Duration::from_millis(100)),
            Some(start + Duration::from_millis(120))
        );
        assert!(state.process_pong(&third, start + Duration::from_millis(30)).is_some());
        assert_eq!(state.deadline(Duration::from_millis(100)), None);
    }

    #[test]
    fn test_overdue_after_grace() {
        let start = Instant::now();
        let grace = Duration::from_millis(50);
        let mut state = KeepaliveState::default();

        assert!(!state.is_overdue(start + Duration::from_secs(60), grace));

        state.record_ping(start);
        assert!(!state.is_overdue(start + Duration::from_millis(49), grace));
        assert!(state.is_overdue(start + Duration::from_millis(50), grace));
    }

    #[test]
    fn test_unknown_pong_ignored() {
        let start = Instant::now();
        let mut state = KeepaliveState::default();
        state.record_ping(start);

        assert_eq!(state.process_pong(&ping_payload(99), start), None);
        assert_eq!(state.outstanding(), 1);
    }
}
