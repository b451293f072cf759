//! Per-connection counters and RTT samples, with derived rates on query.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ring buffer capacity for RTT samples; keeps the accumulator bounded
/// instead of an ever-growing sample vector.
const RTT_RING_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: u64,
    bytes_resent: u64,
    bytes_delivered: u64,
    messages_sent: u64,
    messages_delivered: u64,
    retransmissions: u64,
    ooo_packets: u64,
    duplicate_acks: u64,
    rtt_samples: VecDeque<Duration>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

/// Guards all accumulators with one mutex so sender and receiver
/// activity update them atomically with respect to each other.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    fn touch_start(counters: &mut Counters, now: Instant) {
        if counters.start_time.is_none() {
            counters.start_time = Some(now);
        }
    }

    pub fn record_sent(&self, payload_len: usize, now: Instant) {
        let mut c = self.inner.lock().unwrap();
        Self::touch_start(&mut c, now);
        c.bytes_sent += payload_len as u64;
        c.messages_sent += 1;
    }

    pub fn record_resent(&self, payload_len: usize, packets: u64) {
        let mut c = self.inner.lock().unwrap();
        c.bytes_resent += payload_len as u64;
        c.retransmissions += packets;
    }

    pub fn record_delivered(&self, payload_len: usize, now: Instant) {
        let mut c = self.inner.lock().unwrap();
        Self::touch_start(&mut c, now);
        c.bytes_delivered += payload_len as u64;
        c.messages_delivered += 1;
        c.end_time = Some(now);
    }

    pub fn record_ooo(&self) {
        self.inner.lock().unwrap().ooo_packets += 1;
    }

    pub fn record_duplicate_ack(&self) {
        self.inner.lock().unwrap().duplicate_acks += 1;
    }

    pub fn record_rtt_sample(&self, rtt: Duration) {
        let mut c = self.inner.lock().unwrap();
        if c.rtt_samples.len() == RTT_RING_CAPACITY {
            c.rtt_samples.pop_front();
        }
        c.rtt_samples.push_back(rtt);
    }

    /// Marks `end_time` if it has not already been set by a delivery,
    /// so a snapshot taken after `close()` reports a finalized duration.
    pub fn finalize(&self, now: Instant) {
        let mut c = self.inner.lock().unwrap();
        if c.end_time.is_none() && c.start_time.is_some() {
            c.end_time = Some(now);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.inner.lock().unwrap();
        let rtt_samples: Vec<Duration> = c.rtt_samples.iter().copied().collect();

        let duration = match (c.start_time, c.end_time) {
            (Some(start), Some(end)) if end > start => Some(end - start),
            _ => None,
        };

        let goodput_bps = duration.map(|d| (c.bytes_delivered as f64 * 8.0) / d.as_secs_f64());
        let goodput_msg_per_sec =
            duration.map(|d| c.messages_delivered as f64 / d.as_secs_f64());

        let (avg_rtt, p95_rtt) = if rtt_samples.is_empty() {
            (None, None)
        } else {
            let mut sorted = rtt_samples.clone();
            sorted.sort();
            let total: Duration = sorted.iter().sum();
            let avg = total / sorted.len() as u32;
            let idx = ((0.95 * sorted.len() as f64) as usize).saturating_sub(1);
            (Some(avg), Some(sorted[idx.min(sorted.len() - 1)]))
        };

        let retransmissions_per_kb = if c.bytes_sent > 0 {
            Some(c.retransmissions as f64 / (c.bytes_sent as f64 / 1024.0))
        } else {
            None
        };

        MetricsSnapshot {
            bytes_sent: c.bytes_sent,
            bytes_resent: c.bytes_resent,
            bytes_delivered: c.bytes_delivered,
            messages_sent: c.messages_sent,
            messages_delivered: c.messages_delivered,
            retransmissions: c.retransmissions,
            ooo_packets: c.ooo_packets,
            duplicate_acks: c.duplicate_acks,
            rtt_samples,
            duration,
            goodput_bps,
            goodput_msg_per_sec,
            avg_rtt,
            p95_rtt,
            retransmissions_per_kb,
        }
    }
}

/// An immutable, cheaply clonable point-in-time read of a connection's
/// metrics, including the rates derived from the raw counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_resent: u64,
    pub bytes_delivered: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub retransmissions: u64,
    pub ooo_packets: u64,
    pub duplicate_acks: u64,
    pub rtt_samples: Vec<Duration>,
    pub duration: Option<Duration>,
    pub goodput_bps: Option<f64>,
    pub goodput_msg_per_sec: Option<f64>,
    pub avg_rtt: Option<Duration>,
    pub p95_rtt: Option<Duration>,
    pub retransmissions_per_kb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_metrics_have_no_derived_rates() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.duration, None);
        assert_eq!(snap.avg_rtt, None);
        assert_eq!(snap.retransmissions_per_kb, None);
    }

    #[test]
    fn rtt_ring_buffer_is_bounded() {
        let m = Metrics::new();
        for i in 0..(RTT_RING_CAPACITY + 10) {
            m.record_rtt_sample(Duration::from_millis(i as u64));
        }
        let snap = m.snapshot();
        assert_eq!(snap.rtt_samples.len(), RTT_RING_CAPACITY);
    }

    #[test]
    fn p95_clamps_for_small_sample_sets() {
        let m = Metrics::new();
        m.record_rtt_sample(Duration::from_millis(10));
        let snap = m.snapshot();
        assert_eq!(snap.p95_rtt, Some(Duration::from_millis(10)));
    }

    #[test]
    fn goodput_uses_delivered_bytes_only() {
        let m = Metrics::new();
        let t0 = Instant::now();
        m.record_sent(100, t0);
        m.record_delivered(50, t0 + Duration::from_secs(1));
        let snap = m.snapshot();
        assert_eq!(snap.bytes_delivered, 50);
        assert!(snap.goodput_bps.unwrap() > 0.0);
    }
}
