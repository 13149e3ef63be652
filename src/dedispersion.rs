// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Coherent dedispersion.

Interstellar dispersion delays low frequencies behind high ones; within one
channel the residual sweep is removed by multiplying the channel's spectrum
with a closed-form chirp. Two entry points share the machinery: stations
are dedispersed before beamforming when incoherent products must see the
corrected samples too, beams afterwards when only coherent products need
it. That choice is made once per observation, never per block.

The chirps depend on the channel's sky frequency, so a table is built for
every subband a rank can own; the per-block path only does FFTs and
multiplies.
 */

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{Array2, ArrayViewMut3, Axis};
use rustfft::{Fft, FftPlanner};

use crate::c32;
use crate::constants::DISPERSION_CONSTANT;
use crate::context::Observation;
use crate::data::{BeamFormedData, FilteredData, NR_POLARIZATIONS};

pub struct Dedispersion {
    nr_channels: usize,
    nr_samples: usize,

    /// Per subband: `[channel][fft bin]` chirp factors.
    chirps: HashMap<usize, Array2<c32>>,

    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<c32>,
}

impl Dedispersion {
    /// Build chirp tables for every subband in `subbands` (all subbands a
    /// rank's pset can own).
    pub fn new(obs: &Observation, dispersion_measure: f64, subbands: &[usize]) -> Dedispersion {
        let nr_channels = obs.nr_channels_per_subband;
        let nr_samples = obs.nr_samples_per_channel();
        let channel_width = obs.channel_width();

        // t(f) = DM / (2.41e-4 * f_MHz^2) seconds; in Hz units the
        // dispersion "constant" becomes 1e12 / 2.41e-4 s Hz^2.
        let d = 1.0e12 / DISPERSION_CONSTANT * dispersion_measure;

        let mut chirps = HashMap::new();
        for &sb in subbands {
            let mut table = Array2::zeros((nr_channels, nr_samples));
            for c in 0..nr_channels {
                let f0 = obs.channel_frequency(sb, c);
                for bin in 0..nr_samples {
                    let offset = if bin <= nr_samples / 2 {
                        bin as f64
                    } else {
                        bin as f64 - nr_samples as f64
                    } * channel_width
                        / nr_samples as f64;
                    let phase =
                        2.0 * std::f64::consts::PI * d * offset * offset / (f0 * f0 * (f0 + offset));
                    table[(c, bin)] = c32::new(phase.cos() as f32, phase.sin() as f32);
                }
            }
            chirps.insert(sb, table);
        }

        let mut planner = FftPlanner::new();
        Dedispersion {
            nr_channels,
            nr_samples,
            chirps,
            forward: planner.plan_fft_forward(nr_samples),
            inverse: planner.plan_fft_inverse(nr_samples),
            scratch: vec![c32::default(); nr_samples],
        }
    }

    /// FFT each channel's time series, multiply with the chirp, and
    /// transform back. `data` is `[slice][channel][time][pol]` flattened to
    /// a view per slice.
    fn apply(&mut self, mut data: ArrayViewMut3<c32>, subband: usize) {
        let chirp = &self.chirps[&subband];
        let norm = 1.0 / self.nr_samples as f32;
        for c in 0..self.nr_channels {
            for pol in 0..NR_POLARIZATIONS {
                for t in 0..self.nr_samples {
                    self.scratch[t] = data[(c, t, pol)];
                }
                self.forward.process(&mut self.scratch);
                for (bin, v) in self.scratch.iter_mut().enumerate() {
                    *v *= chirp[(c, bin)];
                }
                self.inverse.process(&mut self.scratch);
                for t in 0..self.nr_samples {
                    data[(c, t, pol)] = self.scratch[t] * norm;
                }
            }
        }
    }

    /// Dedisperse the merged stations of one subband, in place.
    pub fn dedisperse_stations(
        &mut self,
        filtered: &mut FilteredData,
        subband: usize,
        nr_merged_stations: usize,
    ) {
        for s in 0..nr_merged_stations {
            self.apply(filtered.samples.index_axis_mut(Axis(0), s), subband);
        }
    }

    /// Dedisperse the formed beams of one subband, in place.
    pub fn dedisperse_beams(&mut self, bf: &mut BeamFormedData, subband: usize) {
        let nr_beams = bf.samples.shape()[0];
        for b in 0..nr_beams {
            self.apply(bf.samples.index_axis_mut(Axis(0), b), subband);
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::arena::Arena;
    use crate::beamform::BeamFormer;
    use crate::context::tests::small_observation;
    use crate::plan::ProcessingPlan;

    fn filled(obs: &Observation, arena: &Arena) -> FilteredData {
        let mut filtered = FilteredData::new(
            arena,
            obs.nr_stations(),
            obs.nr_channels_per_subband,
            obs.nr_samples_per_channel(),
        );
        for (i, v) in filtered.samples.iter_mut().enumerate() {
            let phase = i as f32 * 0.37;
            *v = c32::new(phase.cos(), phase.sin());
        }
        filtered
    }

    #[test]
    fn zero_dispersion_measure_is_identity() {
        let obs = small_observation();
        let plan = ProcessingPlan::new(&obs).unwrap();
        let arena = Arena::from_plan(&plan);
        let mut filtered = filled(&obs, &arena);
        let before = filtered.samples.clone();

        let mut dd = Dedispersion::new(&obs, 0.0, &[0, 1]);
        dd.dedisperse_stations(&mut filtered, 0, obs.nr_stations());

        for (a, b) in filtered.samples.iter().zip(before.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-4);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-4);
        }
    }

    #[test]
    fn dedispersion_preserves_power() {
        let obs = small_observation();
        let plan = ProcessingPlan::new(&obs).unwrap();
        let arena = Arena::from_plan(&plan);
        let mut filtered = filled(&obs, &arena);
        let power_before: f32 = filtered.samples.iter().map(|v| v.norm_sqr()).sum();

        let mut dd = Dedispersion::new(&obs, 26.76, &[0, 1]);
        dd.dedisperse_stations(&mut filtered, 1, obs.nr_stations());

        let power_after: f32 = filtered.samples.iter().map(|v| v.norm_sqr()).sum();
        assert_abs_diff_eq!(power_before, power_after, epsilon = power_before * 1e-4);
    }

    #[test]
    fn dedispersion_commutes_with_beamforming() {
        // Dedispersion acts per channel identically on every station, and
        // beamforming is a per-channel linear mix of stations, so
        // before/after variants agree on the formed beams.
        let obs = small_observation();
        let dm = 12.3;

        let plan = ProcessingPlan::new(&obs).unwrap();
        let arena_a = Arena::from_plan(&plan);
        let arena_b = Arena::from_plan(&plan);
        let mut filtered_a = filled(&obs, &arena_a);
        let mut filtered_b = filled(&obs, &arena_b);

        let mut bf_data_a = crate::data::BeamFormedData::new(
            &arena_a,
            obs.nr_pencils(),
            obs.nr_channels_per_subband,
            obs.nr_samples_per_channel(),
        );
        let mut bf_data_b = crate::data::BeamFormedData::new(
            &arena_b,
            obs.nr_pencils(),
            obs.nr_channels_per_subband,
            obs.nr_samples_per_channel(),
        );

        let freq = obs.subband_frequency(0);

        // Variant A: dedisperse stations, then beamform.
        let mut dd = Dedispersion::new(&obs, dm, &[0]);
        dd.dedisperse_stations(&mut filtered_a, 0, obs.nr_stations());
        let mut former = BeamFormer::new(&obs);
        former.form_beams(&filtered_a, &mut bf_data_a, 0, freq, 0, 0, 1);

        // Variant B: beamform, then dedisperse the beam.
        let mut former_b = BeamFormer::new(&obs);
        former_b.form_beams(&filtered_b, &mut bf_data_b, 0, freq, 0, 0, 1);
        let mut dd_b = Dedispersion::new(&obs, dm, &[0]);
        dd_b.dedisperse_beams(&mut bf_data_b, 0);

        for (a, b) in bf_data_a.samples.iter().zip(bf_data_b.samples.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-3);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-3);
        }
    }
}
