//! Byte counters with a short rolling window, used for per-peer and
//! per-torrent rate measurements.

use std::time::Instant;

/// The number of one second buckets the rate is averaged over.
const WINDOW_SECS: usize = 5;

/// Counts bytes and derives a rolling per-second rate over a 5 second window.
///
/// Callers pass the current time explicitly so that all counters within a
/// torrent observe the same tick timestamp.
#[derive(Debug, Clone)]
pub(crate) struct Counter {
    /// The total number of bytes recorded over the counter's lifetime.
    total: u64,
    /// Per second buckets, indexed by `bucket_of`.
    window: [u64; WINDOW_SECS],
    /// The absolute second (since `epoch`) the most recent bucket belongs to.
    head_sec: u64,
    /// The instant this counter was created, the origin of bucket arithmetic.
    epoch: Instant,
}

impl Counter {
    pub fn new(now: Instant) -> Self {
        Self {
            total: 0,
            window: [0; WINDOW_SECS],
            head_sec: 0,
            epoch: now,
        }
    }

    /// Records bytes at the given time.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.advance(now);
        self.total += bytes;
        self.window[(self.head_sec as usize) % WINDOW_SECS] += bytes;
    }

    /// The average bytes per second over the rolling window.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.advance(now);
        let sum: u64 = self.window.iter().sum();
        sum / WINDOW_SECS as u64
    }

    /// The total number of bytes recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rotates the window forward, zeroing buckets that fell out of it.
    fn advance(&mut self, now: Instant) {
        let sec = now.duration_since(self.epoch).as_secs();
        if sec <= self.head_sec {
            return;
        }
        let elapsed = sec - self.head_sec;
        if elapsed as usize >= WINDOW_SECS {
            self.window = [0; WINDOW_SECS];
        } else {
            for i in 1..=elapsed {
                let bucket = ((self.head_sec + i) as usize) % WINDOW_SECS;
                self.window[bucket] = 0;
            }
        }
        self.head_sec = sec;
    }
}

/// The pair of counters every byte-moving entity keeps: one for the download
/// direction, one for the upload direction. Only piece payload bytes are
/// recorded here, protocol chatter is not.
#[derive(Debug, Clone)]
pub(crate) struct ThruputCounters {
    pub down: Counter,
    pub up: Counter,
}

impl ThruputCounters {
    pub fn new(now: Instant) -> Self {
        Self {
            down: Counter::new(now),
            up: Counter::new(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_rate_averages_over_window() {
        let start = Instant::now();
        let mut c = Counter::new(start);
        // 5 KiB recorded in the first second
        c.record(start, 5 * 1024);
        assert_eq!(c.rate(start), 1024);
        assert_eq!(c.total(), 5 * 1024);
    }

    #[test]
    fn test_old_buckets_fall_out() {
        let start = Instant::now();
        let mut c = Counter::new(start);
        c.record(start, 5 * 1024);
        // a full window later the rate must have decayed to zero
        let later = start + Duration::from_secs(WINDOW_SECS as u64 + 1);
        assert_eq!(c.rate(later), 0);
        // but the total is forever
        assert_eq!(c.total(), 5 * 1024);
    }

    #[test]
    fn test_partial_decay() {
        let start = Instant::now();
        let mut c = Counter::new(start);
        for sec in 0..WINDOW_SECS as u64 {
            c.record(start + Duration::from_secs(sec), 1024);
        }
        // the window is full: 5 KiB over 5 seconds
        assert_eq!(c.rate(start + Duration::from_secs(4)), 1024);
        // two seconds later two buckets have been zeroed
        let rate = c.rate(start + Duration::from_secs(6));
        assert_eq!(rate, 3 * 1024 / WINDOW_SECS as u64);
    }
}
