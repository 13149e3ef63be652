// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The correlator.

Cross-multiplies every pair of merged stations (auto-correlations included)
over one subband's channels, accumulating only unflagged samples and
normalizing by how many went in. Baselines are enumerated once, canonically,
over the *merged* station list — a physical station that was summed into a
superstation simply never appears as a baseline endpoint.
 */


use ndarray::parallel::prelude::*;
use ndarray::Axis;

use crate::c32;
use crate::context::Observation;
use crate::data::{CorrelatedData, FilteredData, NR_POLARIZATIONS};

/// The canonical baseline index of stations `s1 <= s2`.
pub fn baseline(s1: usize, s2: usize) -> usize {
    debug_assert!(s1 <= s2);
    s2 * (s2 + 1) / 2 + s1
}

pub struct Correlator {
    /// `(s1, s2)` with `s1 <= s2`, in canonical order.
    baselines: Vec<(usize, usize)>,
    nr_channels: usize,
    nr_samples: usize,
}

impl Correlator {
    pub fn new(obs: &Observation) -> Correlator {
        let nr_merged = obs.nr_merged_stations();
        let mut baselines = Vec::with_capacity(nr_merged * (nr_merged + 1) / 2);
        for s2 in 0..nr_merged {
            for s1 in 0..=s2 {
                baselines.push((s1, s2));
            }
        }
        Correlator {
            baselines,
            nr_channels: obs.nr_channels_per_subband,
            nr_samples: obs.nr_samples_per_channel(),
        }
    }

    pub fn nr_baselines(&self) -> usize {
        self.baselines.len()
    }

    /// Merge the two stations' flags into each baseline's valid-sample
    /// counts and centroids. Channel 0 carries the DC/aliasing residue of
    /// the filter bank and gets zero weight whenever there is more than one
    /// channel.
    pub fn compute_flags_and_centroids(
        &self,
        filtered: &FilteredData,
        corr: &mut CorrelatedData,
    ) {
        let nr_samples = self.nr_samples;
        for (bl, &(s1, s2)) in self.baselines.iter().enumerate() {
            let mut flags = filtered.flags[s1].clone();
            flags.union_with(&filtered.flags[s2]);

            let nr_valid = (nr_samples - flags.nr_flagged()) as u32;
            let centroid = if nr_valid == 0 {
                0.0
            } else {
                let sum: usize = flags
                    .unflagged_ranges()
                    .iter()
                    // Sum of (t + 1/2) over [s, e), kept doubled to stay
                    // integral: (s + e) * (e - s).
                    .map(|&(s, e)| (s + e) * (e - s))
                    .sum();
                (sum as f64 / (2 * nr_valid as usize * nr_samples) as f64) as f32
            };
            corr.centroids[bl] = centroid;

            for c in 0..self.nr_channels {
                corr.nr_valid_samples[(bl, c)] =
                    if c == 0 && self.nr_channels > 1 { 0 } else { nr_valid };
            }
        }
    }

    /// The cross-multiply-accumulate over all baselines. Flagged samples
    /// are skipped via the valid ranges; the result is normalized by the
    /// number of samples that contributed.
    pub fn correlate(&self, filtered: &FilteredData, corr: &mut CorrelatedData, block: usize) {
        let baselines = &self.baselines;
        let nr_channels = self.nr_channels;

        corr.visibilities
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(bl, mut vis)| {
                let (s1, s2) = baselines[bl];
                let mut flags = filtered.flags[s1].clone();
                flags.union_with(&filtered.flags[s2]);
                let valid = flags.unflagged_ranges();

                let x1 = filtered.samples.index_axis(Axis(0), s1);
                let x2 = filtered.samples.index_axis(Axis(0), s2);

                for c in 0..nr_channels {
                    if c == 0 && nr_channels > 1 {
                        for p1 in 0..NR_POLARIZATIONS {
                            for p2 in 0..NR_POLARIZATIONS {
                                vis[(c, p1, p2)] = c32::default();
                            }
                        }
                        continue;
                    }
                    let mut acc = [[c32::default(); NR_POLARIZATIONS]; NR_POLARIZATIONS];
                    let mut nr_valid = 0usize;
                    for &(s, e) in &valid {
                        nr_valid += e - s;
                        for t in s..e {
                            for (p1, row) in acc.iter_mut().enumerate() {
                                let a = x1[(c, t, p1)];
                                for (p2, sum) in row.iter_mut().enumerate() {
                                    *sum += a * x2[(c, t, p2)].conj();
                                }
                            }
                        }
                    }
                    let scale = if nr_valid == 0 {
                        0.0
                    } else {
                        1.0 / nr_valid as f32
                    };
                    for p1 in 0..NR_POLARIZATIONS {
                        for p2 in 0..NR_POLARIZATIONS {
                            vis[(c, p1, p2)] = acc[p1][p2] * scale;
                        }
                    }
                }
            });

        corr.block = Some(block);
    }
}
