// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Online RFI flagging.

Both flaggers run the same per-block lifecycle, Idle → Accumulating →
Flagged: gather a detection statistic over the block, then mark outliers.
The detection statistic of the pre-correlation flagger is selected from
configuration at startup — enum dispatch, one virtual-ish call per window,
instead of baking the choice into the types.

Flaggers can only ever add flags. They never fail the observation; the
worst they can do is flag everything.
 */


use log::info;

use crate::c32;
use crate::context::{DetectorKind, PostFlaggerSettings, PreFlaggerSettings};
use crate::correlator::baseline;
use crate::data::{CorrelatedData, FilteredData};

/// Where a flagger is in its per-block lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlaggerState {
    Idle,
    Accumulating,
    Flagged,
}

/// The detection statistic: feed it the block's powers, then ask for a
/// threshold. Robust against its own outliers — the whole point is that
/// interference is in the data the threshold is derived from — so it uses
/// the median and the median absolute deviation rather than mean and
/// standard deviation.
#[derive(Debug, Default, Clone)]
struct PowerStatistics {
    values: Vec<f32>,
    scratch: Vec<f32>,
}

/// MAD to standard-deviation scale for a normal population.
const MAD_SCALE: f32 = 1.4826;

impl PowerStatistics {
    fn reset(&mut self) {
        self.values.clear();
    }

    fn accumulate(&mut self, power: f32) {
        self.values.push(power);
    }

    fn sorted_median(scratch: &mut [f32]) -> f32 {
        if scratch.is_empty() {
            return 0.0;
        }
        scratch.sort_unstable_by(f32::total_cmp);
        scratch[scratch.len() / 2]
    }

    fn median(&mut self) -> f32 {
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.values);
        Self::sorted_median(&mut self.scratch)
    }

    /// The robust spread estimate, 1.4826 * MAD.
    fn spread(&mut self) -> f32 {
        let median = self.median();
        self.scratch.clear();
        self.scratch
            .extend(self.values.iter().map(|v| (v - median).abs()));
        MAD_SCALE * Self::sorted_median(&mut self.scratch)
    }

    /// median + sensitivity * 1.4826 * MAD.
    fn decide(&mut self, sensitivity: f32) -> f32 {
        self.median() + sensitivity * self.spread()
    }
}

/// Flags whole detection windows of station samples before correlation.
pub struct PreCorrelationFlagger {
    detector: DetectorKind,
    integration: usize,
    sensitivity: f32,
    state: FlaggerState,
    /// Window powers, reused every block.
    powers: Vec<f32>,
    stats: PowerStatistics,
}

impl PreCorrelationFlagger {
    pub fn new(settings: &PreFlaggerSettings, nr_samples: usize) -> PreCorrelationFlagger {
        PreCorrelationFlagger {
            detector: settings.detector,
            integration: settings.integration,
            sensitivity: settings.sensitivity,
            state: FlaggerState::Idle,
            powers: vec![0.0; nr_samples / settings.integration],
            stats: PowerStatistics::default(),
        }
    }

    pub fn state(&self) -> FlaggerState {
        self.state
    }

    /// Detect and flag outlier windows in every merged station.
    pub fn flag(&mut self, filtered: &mut FilteredData, nr_merged_stations: usize) {
        let nr_samples = filtered.nr_samples();
        let nr_windows = nr_samples / self.integration;
        let nr_channels = filtered.samples.shape()[1];

        for s in 0..nr_merged_stations {
            self.state = FlaggerState::Accumulating;

            // Total power per window, all channels and polarizations.
            let station = filtered.samples.index_axis(ndarray::Axis(0), s);
            self.stats.reset();
            for (w, power) in self.powers.iter_mut().enumerate().take(nr_windows) {
                let mut p = 0.0f32;
                for c in 0..nr_channels {
                    for i in 0..self.integration {
                        let t = w * self.integration + i;
                        p += station[(c, t, 0)].norm_sqr() + station[(c, t, 1)].norm_sqr();
                    }
                }
                *power = p;
                self.stats.accumulate(p);
            }

            match self.detector {
                DetectorKind::Threshold => {
                    let threshold = self.stats.decide(self.sensitivity);
                    for w in 0..nr_windows {
                        if self.powers[w] > threshold {
                            filtered.flags[s]
                                .include(w * self.integration..(w + 1) * self.integration);
                        }
                    }
                }
                DetectorKind::SumThreshold => {
                    let median = self.stats.median();
                    let base = self.sensitivity * self.stats.spread();
                    // SumThreshold runs on the deviations from the median,
                    // not on raw powers, or the lowered long-run thresholds
                    // would dip under the quiet floor.
                    for p in self.powers[..nr_windows].iter_mut() {
                        *p -= median;
                    }
                    let flagged = sum_threshold(&self.powers[..nr_windows], base);
                    for (w, &is_flagged) in flagged.iter().enumerate() {
                        if is_flagged {
                            filtered.flags[s]
                                .include(w * self.integration..(w + 1) * self.integration);
                        }
                    }
                }
            }
            self.state = FlaggerState::Flagged;
        }
    }
}

/// The SumThreshold pass over median-subtracted powers: progressively
/// longer runs are compared against progressively lower per-sample
/// thresholds, so weak-but-persistent interference is caught as well as
/// single strong hits.
fn sum_threshold(deviations: &[f32], base_threshold: f32) -> Vec<bool> {
    const RHO: f32 = 1.5;
    let mut flagged = vec![false; deviations.len()];
    let mut run = 1usize;
    let mut threshold = base_threshold;
    while run <= 8 && run <= deviations.len() {
        for start in 0..=deviations.len() - run {
            // Already-flagged samples count as clean, so one strong hit
            // doesn't drag its whole neighbourhood over the threshold.
            let sum: f32 = (start..start + run)
                .map(|i| if flagged[i] { 0.0 } else { deviations[i] })
                .sum();
            if sum > threshold * run as f32 {
                for f in flagged.iter_mut().skip(start).take(run) {
                    *f = true;
                }
            }
        }
        run *= 2;
        threshold /= RHO;
    }
    flagged
}

/// What the post-correlation flagger did in one block.
#[derive(Debug, Default, Clone)]
pub struct PostFlagSummary {
    pub nr_flagged_visibilities: usize,
    pub broken_stations: Vec<usize>,
}

/// Flags outlier visibilities after correlation, and optionally declares
/// whole stations broken from their flag density.
pub struct PostCorrelationFlagger {
    sensitivity: f32,
    broken_station_ratio: Option<f32>,
    state: FlaggerState,
    /// |vis| per (baseline, channel), reused every block.
    amplitudes: Vec<f32>,
    stats: PowerStatistics,
}

impl PostCorrelationFlagger {
    pub fn new(
        settings: &PostFlaggerSettings,
        nr_baselines: usize,
        nr_channels: usize,
    ) -> PostCorrelationFlagger {
        PostCorrelationFlagger {
            sensitivity: settings.sensitivity,
            broken_station_ratio: settings.broken_station_ratio,
            state: FlaggerState::Idle,
            amplitudes: vec![0.0; nr_baselines * nr_channels],
            stats: PowerStatistics::default(),
        }
    }

    pub fn state(&self) -> FlaggerState {
        self.state
    }

    pub fn flag(
        &mut self,
        corr: &mut CorrelatedData,
        nr_merged_stations: usize,
    ) -> PostFlagSummary {
        self.state = FlaggerState::Accumulating;
        let (nr_baselines, nr_channels, _, _) = corr.visibilities.dim();

        self.stats.reset();
        for bl in 0..nr_baselines {
            for c in 0..nr_channels {
                let mut a = 0.0f32;
                for p1 in 0..2 {
                    for p2 in 0..2 {
                        a += corr.visibilities[(bl, c, p1, p2)].norm();
                    }
                }
                self.amplitudes[bl * nr_channels + c] = a;
                if corr.nr_valid_samples[(bl, c)] > 0 {
                    self.stats.accumulate(a);
                }
            }
        }

        let threshold = self.stats.decide(self.sensitivity);
        let mut summary = PostFlagSummary::default();
        for bl in 0..nr_baselines {
            for c in 0..nr_channels {
                if corr.nr_valid_samples[(bl, c)] > 0
                    && self.amplitudes[bl * nr_channels + c] > threshold
                {
                    Self::flag_visibility(corr, bl, c);
                    summary.nr_flagged_visibilities += 1;
                }
            }
        }

        if let Some(ratio) = self.broken_station_ratio {
            // Flag density per station over every visibility it touches.
            let mut flagged = vec![0usize; nr_merged_stations];
            let mut total = vec![0usize; nr_merged_stations];
            for s2 in 0..nr_merged_stations {
                for s1 in 0..=s2 {
                    let bl = baseline(s1, s2);
                    for c in 0..nr_channels {
                        for s in [s1, s2] {
                            total[s] += 1;
                            if corr.nr_valid_samples[(bl, c)] == 0 {
                                flagged[s] += 1;
                            }
                        }
                    }
                }
            }
            for s in 0..nr_merged_stations {
                if total[s] > 0 && flagged[s] as f32 / total[s] as f32 > ratio {
                    summary.broken_stations.push(s);
                }
            }
            for &s in &summary.broken_stations {
                for other in 0..nr_merged_stations {
                    let bl = baseline(s.min(other), s.max(other));
                    for c in 0..nr_channels {
                        if corr.nr_valid_samples[(bl, c)] > 0 {
                            Self::flag_visibility(corr, bl, c);
                            summary.nr_flagged_visibilities += 1;
                        }
                    }
                }
            }
            if !summary.broken_stations.is_empty() {
                info!(
                    "post-correlation flagger: stations {:?} look broken, flagged all their baselines",
                    summary.broken_stations
                );
            }
        }

        self.state = FlaggerState::Flagged;
        summary
    }

    /// Flagging a visibility zeroes its weight and its value; weights only
    /// ever decrease here, never recover.
    fn flag_visibility(corr: &mut CorrelatedData, bl: usize, c: usize) {
        corr.nr_valid_samples[(bl, c)] = 0;
        for p1 in 0..2 {
            for p2 in 0..2 {
                corr.visibilities[(bl, c, p1, p2)] = c32::default();
            }
        }
    }
}
