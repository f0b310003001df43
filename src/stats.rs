//! Aggregate timing and outcome counters for finished requests.

use std::{sync::Mutex, time::Duration};

use crate::{
    error::AbortReason,
    request::{RequestOutcome, RequestType},
};

const NUM_TYPES: usize = 4;
const NUM_BUCKETS: usize = 32;

/// Counters for one request type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl TypeStats {
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out + self.aborted
    }

    pub fn mean_micros(&self) -> u64 {
        let finished = self.finished();
        if finished == 0 {
            0
        } else {
            self.total_micros / finished
        }
    }
}

/// Power-of-two latency histogram: bucket `i` counts requests that finished in
/// `[2^i, 2^(i+1))` microseconds.
#[derive(Clone, Debug, Default)]
pub struct LatencyHistogram {
    buckets: [u64; NUM_BUCKETS],
}

impl LatencyHistogram {
    fn record(&mut self, elapsed: Duration) {
        let micros = elapsed.as_micros().max(1) as u64;
        let bucket = (micros.ilog2() as usize).min(NUM_BUCKETS - 1);
        self.buckets[bucket] += 1;
    }

    pub fn buckets(&self) -> &[u64; NUM_BUCKETS] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Default)]
struct StatsInner {
    per_type: [TypeStats; NUM_TYPES],
    latency: LatencyHistogram,
}

/// Point-in-time copy of the aggregates.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    per_type: [TypeStats; NUM_TYPES],
    pub latency: LatencyHistogram,
}

impl StatsSnapshot {
    pub fn for_type(&self, request_type: RequestType) -> &TypeStats {
        &self.per_type[request_type.index()]
    }

    pub fn total_started(&self) -> u64 {
        self.per_type.iter().map(|stats| stats.started).sum()
    }
}

/// Collects per-request timings as requests start and finish.
#[derive(Default)]
pub struct RequestStats {
    inner: Mutex<StatsInner>,
}

impl RequestStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self, request_type: RequestType) {
        let mut inner = self.inner.lock().unwrap();
        inner.per_type[request_type.index()].started += 1;
    }

    pub(crate) fn record_finished(
        &self,
        request_type: RequestType,
        elapsed: Duration,
        outcome: &RequestOutcome,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let stats = &mut inner.per_type[request_type.index()];
        match outcome {
            RequestOutcome::Succeeded => stats.succeeded += 1,
            RequestOutcome::Failed(error) => match error.abort_reason() {
                Some(AbortReason::Timeout) => stats.timed_out += 1,
                Some(_) => stats.aborted += 1,
                None => stats.failed += 1,
            },
        }
        let micros = elapsed.as_micros() as u64;
        stats.total_micros += micros;
        stats.max_micros = stats.max_micros.max(micros);
        inner.latency.record(elapsed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap();
        StatsSnapshot {
            per_type: inner.per_type,
            latency: inner.latency.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::Error;

    #[test]
    fn outcomes_land_in_their_counters() {
        let stats = RequestStats::new();
        stats.record_started(RequestType::SingleNode);
        stats.record_started(RequestType::SingleNode);
        stats.record_started(RequestType::SingleNode);

        stats.record_finished(
            RequestType::SingleNode,
            Duration::from_micros(100),
            &RequestOutcome::Succeeded,
        );
        stats.record_finished(
            RequestType::SingleNode,
            Duration::from_micros(300),
            &RequestOutcome::Failed(Error::aborted(AbortReason::Timeout)),
        );
        stats.record_finished(
            RequestType::SingleNode,
            Duration::from_micros(200),
            &RequestOutcome::Failed(Error::internal("boom")),
        );

        let snapshot = stats.snapshot();
        let per_type = snapshot.for_type(RequestType::SingleNode);
        assert_eq!(per_type.started, 3);
        assert_eq!(per_type.succeeded, 1);
        assert_eq!(per_type.timed_out, 1);
        assert_eq!(per_type.failed, 1);
        assert_eq!(per_type.max_micros, 300);
        assert_eq!(per_type.mean_micros(), 200);
        assert_eq!(snapshot.latency.total(), 3);
    }

    #[test]
    fn latency_buckets_are_power_of_two() {
        let mut histogram = LatencyHistogram::default();
        histogram.record(Duration::from_micros(1));
        histogram.record(Duration::from_micros(3));
        histogram.record(Duration::from_micros(1000));
        assert_eq!(histogram.buckets()[0], 1);
        assert_eq!(histogram.buckets()[1], 1);
        // 1000 µs lands in [512, 1024).
        assert_eq!(histogram.buckets()[9], 1);
        assert_eq!(histogram.total(), 3);
    }
}
