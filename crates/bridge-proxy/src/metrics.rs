//! Dispatch metrics attached to every proxy (spec §3 `MetricsRecord`,
//! §4.8 "Dispatch Metrics Rules").

use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

/// Upper bounds (ms) of the fixed latency buckets, in order. A sample
/// lands in the first bucket whose bound is `>=` it; anything past the
/// last bound falls into the terminal ">1000ms" bucket.
pub const LATENCY_BUCKET_BOUNDS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyHistogram {
    pub buckets: [u64; LATENCY_BUCKET_BOUNDS_MS.len()],
    pub overflow: u64,
}

impl LatencyHistogram {
    fn record(&mut self, duration_ms: f64) {
        for (i, bound) in LATENCY_BUCKET_BOUNDS_MS.iter().enumerate() {
            if duration_ms <= *bound as f64 {
                self.buckets[i] += 1;
                return;
            }
        }
        self.overflow += 1;
    }
}

/// One entry in a proxy's ring buffer of recent dispatch outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentEntry {
    pub message: String,
    pub success: bool,
    pub duration_ms: f64,
    pub timestamp: OffsetDateTime,
    pub error: Option<String>,
}

/// Default ring-buffer capacity (spec §3: "most recent N (default 16,
/// configurable)").
pub const DEFAULT_RECENT_LIMIT: usize = 16;

/// One message's slice of the aggregate counters (spec §3 "Per-message
/// sub-records mirror the aggregate counters"). Carries the same
/// counter set as `MetricsRecord` minus the latency histogram and ring
/// buffer, which stay aggregate-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerMessageRecord {
    pub invocations: u64,
    pub failures: u64,
    pub cumulative_duration_ms: f64,
    pub last_duration_ms: Option<f64>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub success_streak: u64,
    pub last_outcome: Option<bool>,
    pub last_timestamp: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl PerMessageRecord {
    fn record(&mut self, success: bool, duration_ms: f64, timestamp: OffsetDateTime, error: Option<String>) {
        self.invocations += 1;
        if success {
            self.success_streak += 1;
        } else {
            self.failures += 1;
            self.success_streak = 0;
        }

        self.cumulative_duration_ms += duration_ms;
        self.last_duration_ms = Some(duration_ms);
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));

        self.last_outcome = Some(success);
        self.last_timestamp = Some(timestamp);
        self.last_error = error;
    }

    pub fn failure_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        (self.failures as f64 / self.invocations as f64).clamp(0.0, 1.0)
    }

    pub fn success_rate(&self) -> f64 {
        1.0 - self.failure_rate()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub invocations: u64,
    pub failures: u64,
    pub cumulative_duration_ms: f64,
    pub last_duration_ms: Option<f64>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub success_streak: u64,
    pub last_outcome: Option<bool>,
    pub last_timestamp: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub latency_histogram: LatencyHistogram,
    pub recent: VecDeque<RecentEntry>,
    pub by_message: HashMap<String, PerMessageRecord>,
    recent_limit: usize,
}

impl MetricsRecord {
    pub fn new(recent_limit: usize) -> Self {
        MetricsRecord {
            invocations: 0,
            failures: 0,
            cumulative_duration_ms: 0.0,
            last_duration_ms: None,
            min_duration_ms: None,
            max_duration_ms: None,
            success_streak: 0,
            last_outcome: None,
            last_timestamp: None,
            last_error: None,
            latency_histogram: LatencyHistogram::default(),
            recent: VecDeque::new(),
            by_message: HashMap::new(),
            recent_limit: recent_limit.max(1),
        }
    }

    /// The per-message sub-record for `message`, if at least one
    /// invocation of it has been recorded.
    pub fn message_record(&self, message: &str) -> Option<&PerMessageRecord> {
        self.by_message.get(message)
    }

    pub fn recent_limit(&self) -> usize {
        self.recent_limit
    }

    pub fn set_recent_limit(&mut self, limit: usize) {
        self.recent_limit = limit.max(1);
        while self.recent.len() > self.recent_limit {
            self.recent.pop_front();
        }
    }

    /// Record one forward invocation outcome, applying every rule in
    /// spec §4.8 atomically (from the proxy owner's perspective — the
    /// caller holds whatever lock guards this record).
    pub fn record(
        &mut self,
        message: &str,
        success: bool,
        duration_ms: f64,
        timestamp: OffsetDateTime,
        error: Option<String>,
    ) {
        self.invocations += 1;
        if success {
            self.success_streak += 1;
        } else {
            self.failures += 1;
            self.success_streak = 0;
        }

        self.cumulative_duration_ms += duration_ms;
        self.last_duration_ms = Some(duration_ms);
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = Some(self.max_duration_ms.map_or(duration_ms, |m| m.max(duration_ms)));
        self.latency_histogram.record(duration_ms);

        self.last_outcome = Some(success);
        self.last_timestamp = Some(timestamp);
        self.last_error = error.clone();

        self.by_message
            .entry(message.to_string())
            .or_default()
            .record(success, duration_ms, timestamp, error.clone());

        if self.recent.len() >= self.recent_limit {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentEntry {
            message: message.to_string(),
            success,
            duration_ms,
            timestamp,
            error,
        });
    }

    pub fn failure_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        (self.failures as f64 / self.invocations as f64).clamp(0.0, 1.0)
    }

    pub fn success_rate(&self) -> f64 {
        1.0 - self.failure_rate()
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.cumulative_duration_ms / self.invocations as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    #[test]
    fn success_and_failure_counters() {
        let mut m = MetricsRecord::new(DEFAULT_RECENT_LIMIT);
        m.record("getSlot", true, 2.0, ts(), None);
        m.record("getSlot", false, 4.0, ts(), Some("boom".to_string()));

        assert_eq!(m.invocations, 2);
        assert_eq!(m.failures, 1);
        assert_eq!(m.success_streak, 0);
        assert_eq!(m.failure_rate(), 0.5);
        assert_eq!(m.success_rate(), 0.5);
        assert_eq!(m.average_duration_ms(), 3.0);
    }

    #[test]
    fn min_max_and_streak_track_independently() {
        let mut m = MetricsRecord::new(DEFAULT_RECENT_LIMIT);
        m.record("a", true, 10.0, ts(), None);
        m.record("a", true, 2.0, ts(), None);
        m.record("a", true, 50.0, ts(), None);

        assert_eq!(m.min_duration_ms, Some(2.0));
        assert_eq!(m.max_duration_ms, Some(50.0));
        assert_eq!(m.success_streak, 3);
    }

    #[test]
    fn failure_resets_streak() {
        let mut m = MetricsRecord::new(DEFAULT_RECENT_LIMIT);
        m.record("a", true, 1.0, ts(), None);
        m.record("a", true, 1.0, ts(), None);
        m.record("a", false, 1.0, ts(), Some("e".to_string()));
        assert_eq!(m.success_streak, 0);
    }

    #[test]
    fn latency_bucket_attribution() {
        let mut hist = LatencyHistogram::default();
        for ms in [0.5, 1.0, 3.0, 10.0, 999.0, 1000.0, 1000.1, 5000.0] {
            hist.record(ms);
        }
        assert_eq!(hist.buckets[0], 2); // 0.5, 1.0 -> bucket bound 1
        assert_eq!(hist.buckets[2], 1); // 3.0 -> bound 10
        assert_eq!(hist.buckets[2] + hist.buckets[1], 1 + 1); // sanity: 10.0 falls in bound 10 too
        assert_eq!(hist.overflow, 2); // 1000.1, 5000.0
    }

    #[test]
    fn per_message_sub_records_mirror_the_aggregate_counters() {
        let mut m = MetricsRecord::new(DEFAULT_RECENT_LIMIT);
        m.record("getSlot", true, 2.0, ts(), None);
        m.record("getSlot", false, 8.0, ts(), Some("boom".to_string()));
        m.record("setSlot", true, 1.0, ts(), None);

        let get_slot = m.message_record("getSlot").unwrap();
        assert_eq!(get_slot.invocations, 2);
        assert_eq!(get_slot.failures, 1);
        assert_eq!(get_slot.success_streak, 0);
        assert_eq!(get_slot.min_duration_ms, Some(2.0));
        assert_eq!(get_slot.max_duration_ms, Some(8.0));
        assert_eq!(get_slot.last_error.as_deref(), Some("boom"));
        assert_eq!(get_slot.failure_rate(), 0.5);

        let set_slot = m.message_record("setSlot").unwrap();
        assert_eq!(set_slot.invocations, 1);
        assert_eq!(set_slot.failures, 0);

        assert_eq!(m.invocations, 3);
        assert!(m.message_record("missing").is_none());
    }

    #[test]
    fn ring_buffer_drops_oldest_when_full() {
        let mut m = MetricsRecord::new(2);
        m.record("a", true, 1.0, ts(), None);
        m.record("b", true, 1.0, ts(), None);
        m.record("c", true, 1.0, ts(), None);

        let messages: Vec<_> = m.recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn shrinking_recent_limit_trims_existing_entries() {
        let mut m = MetricsRecord::new(4);
        for name in ["a", "b", "c", "d"] {
            m.record(name, true, 1.0, ts(), None);
        }
        m.set_recent_limit(2);
        let messages: Vec<_> = m.recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["c", "d"]);
    }
}
