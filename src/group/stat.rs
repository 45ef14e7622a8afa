//! Transfer rate sampling

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default averaging window
const WINDOW: Duration = Duration::from_secs(10);

/// Windowed speed calculator driven by the engine clock
#[derive(Debug)]
pub struct SpeedCalc {
    window: Duration,
    /// Recent samples (timestamp, bytes)
    samples: VecDeque<(Instant, u64)>,
    total_bytes: u64,
}

impl Default for SpeedCalc {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

impl SpeedCalc {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total_bytes: 0,
        }
    }

    /// Record `bytes` transferred at `now`
    pub fn add_bytes(&mut self, bytes: u64, now: Instant) {
        self.total_bytes += bytes;
        match self.samples.back_mut() {
            Some((at, n)) if *at == now => *n += bytes,
            _ => self.samples.push_back((now, bytes)),
        }
        self.evict(now);
    }

    /// Bytes per second over the window ending at `now`.
    ///
    /// The divisor is never below one second, so a burst right after
    /// start-up does not read as an enormous rate.
    pub fn speed(&self, now: Instant) -> u64 {
        let mut bytes = 0;
        let mut oldest = None;
        for &(at, n) in self.samples.iter().rev() {
            if now.saturating_duration_since(at) > self.window {
                break;
            }
            bytes += n;
            oldest = Some(at);
        }
        let Some(oldest) = oldest else {
            return 0;
        };
        let span = now.saturating_duration_since(oldest).as_secs_f64().max(1.0);
        (bytes as f64 / span) as u64
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.total_bytes = 0;
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of a group's transfer figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStat {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub session_download_length: u64,
    pub session_upload_length: u64,
}
