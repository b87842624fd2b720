// src/pipeline/metrics.rs
//
// Per-session counters. Written by the frame loop, read concurrently by
// status queries and the stop path.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub total_frames: AtomicU64,
    pub qualifying_frames: AtomicU64,
    pub warning_episodes: AtomicU64,
    pub incidents_created: AtomicU64,
    pub enrichment_dispatched: AtomicU64,
    pub enrichment_dropped: AtomicU64,
    /// Last measured rate, stored as f64 bits.
    fps_bits: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Final numbers for a session that ran `elapsed_secs`.
    pub fn statistics(&self, elapsed_secs: f64) -> SessionStatistics {
        let total_frames = self.frames();
        let average_fps = if elapsed_secs > 0.0 {
            total_frames as f64 / elapsed_secs
        } else {
            0.0
        };
        SessionStatistics {
            total_frames,
            processing_time: elapsed_secs,
            average_fps,
            incidents_detected: self.get(&self.incidents_created),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStatistics {
    pub total_frames: u64,
    pub processing_time: f64,
    pub average_fps: f64,
    pub incidents_detected: u64,
}

/// Session-average frames per second: all frames since the session
/// started over the elapsed time, recomputed at most once per interval.
#[derive(Debug)]
pub struct FpsMeter {
    interval_secs: f64,
    started_at: f64,
    last_update: f64,
}

impl FpsMeter {
    pub fn new(interval_secs: f64, started_at: f64) -> Self {
        Self {
            interval_secs,
            started_at,
            last_update: started_at,
        }
    }

    /// Returns the new rate when an interval has passed since the last one.
    pub fn tick(&mut self, now: f64, total_frames: u64) -> Option<f64> {
        let elapsed = now - self.started_at;
        if now - self.last_update >= self.interval_secs && elapsed > 0.0 {
            self.last_update = now;
            Some(total_frames as f64 / elapsed)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_average_fps() {
        let metrics = SessionMetrics::new();
        for _ in 0..50 {
            metrics.inc(&metrics.total_frames);
        }
        metrics.inc(&metrics.incidents_created);

        let stats = metrics.statistics(10.0);
        assert_eq!(stats.total_frames, 50);
        assert_eq!(stats.average_fps, 5.0);
        assert_eq!(stats.incidents_detected, 1);

        assert_eq!(metrics.statistics(0.0).average_fps, 0.0);
    }

    #[test]
    fn test_fps_meter_is_cumulative_per_interval() {
        let mut meter = FpsMeter::new(1.0, 0.0);
        assert_eq!(meter.tick(0.5, 5), None);
        assert_eq!(meter.tick(1.0, 10), Some(10.0));
        assert_eq!(meter.tick(1.5, 20), None);
        // 40 frames over 2s since start, not 30 over the last second
        assert_eq!(meter.tick(2.0, 40), Some(20.0));
    }

    #[test]
    fn test_fps_meter_ignores_zero_elapsed() {
        let mut meter = FpsMeter::new(0.0, 5.0);
        assert_eq!(meter.tick(5.0, 1), None);
        assert_eq!(meter.tick(6.0, 3), Some(3.0));
    }

    #[test]
    fn test_fps_stored_as_bits() {
        let metrics = SessionMetrics::new();
        metrics.set_fps(29.97);
        assert_eq!(metrics.fps(), 29.97);
    }
}
