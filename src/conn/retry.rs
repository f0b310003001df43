use std::time::{Duration, Instant};

/// Reconnection backoff schedule: doubling delays from ~9.77 ms up to a steady 2.5 s.
pub(crate) const BACKOFF_SCHEDULE: [Duration; 9] = [
    Duration::from_nanos(9_765_625),
    Duration::from_nanos(19_531_250),
    Duration::from_nanos(39_062_500),
    Duration::from_nanos(78_125_000),
    Duration::from_nanos(156_250_000),
    Duration::from_nanos(312_500_000),
    Duration::from_nanos(625_000_000),
    Duration::from_nanos(1_250_000_000),
    Duration::from_nanos(2_500_000_000),
];

/// Tracks where a connection is in the backoff schedule.
///
/// The first failed attempt picks the smallest table entry strictly greater than the time the
/// attempt itself took, so a slow failing connect does not add a delay shorter than the
/// connect latency. Every further failure advances one entry; the last entry repeats forever.
#[derive(Debug)]
pub(crate) struct RetryTimer {
    first_attempt_started: Option<Instant>,
    index: Option<usize>,
}

impl RetryTimer {
    pub(crate) fn new() -> Self {
        Self {
            first_attempt_started: None,
            index: None,
        }
    }

    /// Marks the start of a connect attempt. Only the first attempt of a failure streak is
    /// recorded; it anchors the initial delay choice.
    pub(crate) fn attempt_starting(&mut self) {
        if self.index.is_none() && self.first_attempt_started.is_none() {
            self.first_attempt_started = Some(Instant::now());
        }
    }

    /// Returns how long to back off after a failed attempt.
    pub(crate) fn delay_after_failure(&mut self) -> Duration {
        let index = match self.index {
            None => {
                let elapsed = self
                    .first_attempt_started
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                self.first_delay_index(elapsed)
            }
            Some(index) => (index + 1).min(BACKOFF_SCHEDULE.len() - 1),
        };
        self.index = Some(index);
        BACKOFF_SCHEDULE[index]
    }

    /// Forgets the failure streak after a successful connect.
    pub(crate) fn reset(&mut self) {
        self.first_attempt_started = None;
        self.index = None;
    }

    fn first_delay_index(&self, elapsed: Duration) -> usize {
        BACKOFF_SCHEDULE
            .iter()
            .position(|delay| *delay > elapsed)
            .unwrap_or(BACKOFF_SCHEDULE.len() - 1)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn schedule_doubles_up_to_the_cap() {
        for window in BACKOFF_SCHEDULE.windows(2) {
            assert_eq!(window[0] * 2, window[1]);
        }
        assert_eq!(BACKOFF_SCHEDULE[0], Duration::from_nanos(9_765_625));
        assert_eq!(BACKOFF_SCHEDULE[8], Duration::from_millis(2_500));
    }

    #[test]
    fn consecutive_failures_walk_the_table_and_stabilize() {
        let mut timer = RetryTimer::new();
        timer.attempt_starting();

        let mut delays = Vec::new();
        for _ in 0..12 {
            delays.push(timer.delay_after_failure());
        }

        // Immediate failures start at the first entry and advance one per failure.
        assert_eq!(&delays[..9], &BACKOFF_SCHEDULE[..]);
        // Steady state: 2.5 s forever after.
        assert_eq!(delays[9], BACKOFF_SCHEDULE[8]);
        assert_eq!(delays[11], BACKOFF_SCHEDULE[8]);
    }

    #[test]
    fn slow_first_attempt_skips_shorter_entries() {
        let timer = RetryTimer::new();
        assert_eq!(timer.first_delay_index(Duration::from_millis(100)), 4);
        assert_eq!(timer.first_delay_index(Duration::from_millis(0)), 0);
        // Longer than every entry saturates at the last one.
        assert_eq!(timer.first_delay_index(Duration::from_secs(10)), 8);
    }

    #[test]
    fn reset_restarts_the_streak() {
        let mut timer = RetryTimer::new();
        timer.attempt_starting();
        let _ = timer.delay_after_failure();
        let _ = timer.delay_after_failure();
        timer.reset();
        timer.attempt_starting();
        assert_eq!(timer.delay_after_failure(), BACKOFF_SCHEDULE[0]);
    }
}
