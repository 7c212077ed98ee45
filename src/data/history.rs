//! Trailing sample history used to smooth noisy readings.

use std::collections::VecDeque;

use crate::data::sensor::SensorReading;

/// FIFO of the most recent samples of one metric.
///
/// Holds at most `capacity` samples; pushing into a full history evicts the
/// oldest one.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingHistory {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl TrailingHistory {
    /// Create an empty history. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Add a sample and return the mean of the retained samples.
    pub fn push(&mut self, sample: f64) -> f64 {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.mean().unwrap_or(sample)
    }

    /// Arithmetic mean of the retained samples, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

/// One [`TrailingHistory`] per beacon metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingHistory {
    battery: TrailingHistory,
    temperature: TrailingHistory,
    humidity: TrailingHistory,
}

impl ReadingHistory {
    /// Create histories of `capacity` samples each.
    pub fn new(capacity: usize) -> Self {
        Self {
            battery: TrailingHistory::new(capacity),
            temperature: TrailingHistory::new(capacity),
            humidity: TrailingHistory::new(capacity),
        }
    }

    /// Record a reading and return the per-metric means.
    pub fn push(&mut self, reading: SensorReading) -> SensorReading {
        SensorReading {
            battery: self.battery.push(reading.battery),
            temperature: self.temperature.push(reading.temperature),
            humidity: self.humidity.push(reading.humidity),
        }
    }

    /// Number of readings currently averaged.
    pub fn len(&self) -> usize {
        self.battery.len()
    }

    /// Check if no readings have been recorded.
    pub fn is_empty(&self) -> bool {
        self.battery.is_empty()
    }
}
