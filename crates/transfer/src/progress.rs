use std::sync::Mutex;
use std::time::{Duration, Instant};

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Estimates transfer speed from a sliding window of completed chunks.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window`: time window the speed is averaged over (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window: window.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn record(&self, bytes: u64) {
        let Ok(mut s) = self.inner.lock() else {
            return;
        };
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second over the window, 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let Ok(s) = self.inner.lock() else {
            return 0.0;
        };
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes`, `None` while the speed is unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    #[cfg(test)]
    fn sample_count(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }
}
