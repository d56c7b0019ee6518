//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcore.
//
// Mailcore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcore is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcore. If not, see <http://www.gnu.org/licenses/>.

//! Minimal timing metrics.
//!
//! There is no exporter here. Samples either go to the log at debug level or
//! are kept in memory for whoever wants to inspect them.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

/// Something that accepts duration samples under a metric name.
pub trait MetricRecorder: Send + Sync {
    fn record_duration(&self, name: &str, duration: Duration);
}

/// Writes every sample to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl MetricRecorder for LogMetrics {
    fn record_duration(&self, name: &str, duration: Duration) {
        debug!("metric {} took {}us", name, duration.as_micros());
    }
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct RecordedMetrics {
    samples: Mutex<Vec<(String, Duration)>>,
}

impl RecordedMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Return all samples recorded under `name`, oldest first.
    pub fn samples(&self, name: &str) -> Vec<Duration> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|&&(ref n, _)| n == name)
            .map(|&(_, d)| d)
            .collect()
    }
}

impl MetricRecorder for RecordedMetrics {
    fn record_duration(&self, name: &str, duration: Duration) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_owned(), duration));
    }
}

/// A running timer. The sample is recorded when `stop()` is called or the
/// value is dropped, whichever happens first.
pub struct TimeMetric<'a> {
    recorder: &'a dyn MetricRecorder,
    name: String,
    start: Option<Instant>,
}

impl<'a> TimeMetric<'a> {
    pub fn start(recorder: &'a dyn MetricRecorder, name: String) -> Self {
        TimeMetric {
            recorder,
            name,
            start: Some(Instant::now()),
        }
    }

    pub fn stop(mut self) -> Duration {
        self.finish().unwrap_or_default()
    }

    fn finish(&mut self) -> Option<Duration> {
        let start = self.start.take()?;
        let elapsed = start.elapsed();
        self.recorder.record_duration(&self.name, elapsed);
        Some(elapsed)
    }
}

impl Drop for TimeMetric<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timer_records_exactly_once() {
        let metrics = RecordedMetrics::new();
        let timer = TimeMetric::start(&*metrics, "op".to_owned());
        std::thread::sleep(Duration::from_millis(2));
        let elapsed = timer.stop();

        let samples = metrics.samples("op");
        assert_eq!(vec![elapsed], samples);
        assert!(elapsed >= Duration::from_millis(2));
        assert!(metrics.samples("other").is_empty());
    }

    #[test]
    fn dropped_timer_still_records() {
        let metrics = RecordedMetrics::new();
        {
            let _timer = TimeMetric::start(&*metrics, "op".to_owned());
        }
        assert_eq!(1, metrics.samples("op").len());
    }
}
