// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-stage wall-clock accounting.
//!
//! One `Metrics` per rank, owned by the orchestrator and passed to
//! whatever wants to time itself — there are no process-wide counters. The
//! summary is logged once, at `postprocess`.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::info;

#[derive(Debug, Default, Clone, Copy)]
struct StageTimer {
    total: Duration,
    max: Duration,
    count: u64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    timers: IndexMap<&'static str, StageTimer>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    /// Run `f`, attributing its wall-clock time to `stage`.
    pub fn time<R>(&mut self, stage: &'static str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        let timer = self.timers.entry(stage).or_default();
        timer.total += elapsed;
        timer.max = timer.max.max(elapsed);
        timer.count += 1;
        result
    }

    pub fn nr_calls(&self, stage: &'static str) -> u64 {
        self.timers.get(stage).map(|t| t.count).unwrap_or(0)
    }

    pub fn total(&self, stage: &'static str) -> Duration {
        self.timers.get(stage).map(|t| t.total).unwrap_or_default()
    }

    /// Log every stage's accumulated timing, in first-use order.
    pub fn log_summary(&self, rank: usize) {
        for (stage, timer) in &self.timers {
            if timer.count == 0 {
                continue;
            }
            info!(
                "rank {rank:4}: {stage:24} {:>6} calls, avg {:>9.3?}, max {:>9.3?}, total {:>9.3?}",
                timer.count,
                timer.total / timer.count as u32,
                timer.max,
                timer.total,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_accumulate_per_stage() {
        let mut metrics = Metrics::new();
        let mut x = 0u64;
        for _ in 0..3 {
            x = metrics.time("spin", || x + 1);
        }
        metrics.time("other", || ());

        assert_eq!(x, 3);
        assert_eq!(metrics.nr_calls("spin"), 3);
        assert_eq!(metrics.nr_calls("other"), 1);
        assert_eq!(metrics.nr_calls("absent"), 0);
        assert!(metrics.total("spin") >= Duration::ZERO);
    }
}
