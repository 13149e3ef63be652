// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Beam forming.

Sums (super)station voltages into pointed pencil beams, weighted per
(station, beam, channel) by the geometric-delay phase for the beam's
direction. Weights are refreshed once per block — a far coarser cadence
than per sample, and plenty for delay tracking at these field sizes. The
beam range of a [`BeamFormer::form_beams`] call exists purely so the caller
can overlap computation with the beam transpose; chunking the range
differently can never change the samples produced.

In fly's-eye mode every merged station simply becomes its own beam.
 */


use ndarray::parallel::prelude::*;
use ndarray::{Axis, Zip};

use crate::c32;
use crate::constants::SPEED_OF_LIGHT;
use crate::context::Observation;
use crate::data::{BeamFormedData, FilteredData};

pub struct BeamFormer {
    nr_merged_stations: usize,
    nr_channels: usize,
    subband_width: f64,
    flys_eye: bool,

    /// Merged-station member lists, ordered so slot `m` only reads
    /// station slices `>= m` (see `Observation::merged_stations`).
    merge_table: Vec<Vec<usize>>,

    /// Mean member position per merged station \[metres\].
    positions: Vec<[f64; 3]>,

    /// Pencil directions (unit vectors).
    directions: Vec<[f64; 3]>,

    /// `[beam][station][channel]`; refreshed at block cadence.
    weights: ndarray::Array3<c32>,
    weights_for: Option<(usize, usize)>,
}

impl BeamFormer {
    pub fn new(obs: &Observation) -> BeamFormer {
        let merged = obs.merged_stations();
        let positions: Vec<[f64; 3]> = merged
            .iter()
            .map(|m| {
                let mut p = [0.0; 3];
                for &s in &m.members {
                    for (acc, x) in p.iter_mut().zip(obs.station[s].position.iter()) {
                        *acc += x;
                    }
                }
                p.map(|x| x / m.members.len() as f64)
            })
            .collect();
        let directions: Vec<[f64; 3]> = obs.pencils().iter().map(|p| p.direction).collect();

        BeamFormer {
            nr_merged_stations: merged.len(),
            nr_channels: obs.nr_channels_per_subband,
            subband_width: obs.subband_width,
            flys_eye: obs.fly_s_eye,
            merge_table: merged.into_iter().map(|m| m.members).collect(),
            positions,
            weights: ndarray::Array3::zeros((
                directions.len(),
                obs.nr_merged_stations(),
                obs.nr_channels_per_subband,
            )),
            directions,
            weights_for: None,
        }
    }

    pub fn nr_merged_stations(&self) -> usize {
        self.nr_merged_stations
    }

    /// Sum superstation members into their merged slots, in place, and
    /// union their flags. A no-op when there are no superstations.
    pub fn merge_stations(&self, filtered: &mut FilteredData) {
        for (m, members) in self.merge_table.iter().enumerate() {
            if members.len() == 1 && members[0] == m {
                continue;
            }
            let (first, rest) = (members[0], &members[1..]);
            if first != m {
                let (mut dst, src) = filtered.samples.multi_slice_mut((
                    ndarray::s![m, .., .., ..],
                    ndarray::s![first, .., .., ..],
                ));
                dst.assign(&src);
                filtered.flags[m] = filtered.flags[first].clone();
            }
            for &s in rest {
                let (mut dst, src) = filtered
                    .samples
                    .multi_slice_mut((ndarray::s![m, .., .., ..], ndarray::s![s, .., .., ..]));
                dst.zip_mut_with(&src, |d, &x| *d += x);
                let member_flags = filtered.flags[s].clone();
                filtered.flags[m].union_with(&member_flags);
            }
        }
    }

    /// The geometric delay of a merged station towards a direction
    /// \[seconds\]; positive when the wavefront reaches the station late.
    fn delay(&self, station: usize, beam: usize) -> f64 {
        let p = self.positions[station];
        let d = self.directions[beam];
        (p[0] * d[0] + p[1] * d[1] + p[2] * d[2]) / SPEED_OF_LIGHT
    }

    fn update_weights(&mut self, subband: usize, center_frequency: f64, block: usize) {
        if self.weights_for == Some((subband, block)) {
            return;
        }
        let half_band = self.subband_width / 2.0;
        let channel_width = self.subband_width / self.nr_channels as f64;
        for b in 0..self.directions.len() {
            for s in 0..self.nr_merged_stations {
                let delay = self.delay(s, b);
                for c in 0..self.nr_channels {
                    let freq = center_frequency - half_band + (c as f64 + 0.5) * channel_width;
                    let phase = -2.0 * std::f64::consts::PI * freq * delay;
                    self.weights[(b, s, c)] = c32::new(phase.cos() as f32, phase.sin() as f32);
                }
            }
        }
        self.weights_for = Some((subband, block));
    }

    /// Form beams `first_beam..first_beam + nr_beams` from the merged
    /// station data.
    #[allow(clippy::too_many_arguments)]
    pub fn form_beams(
        &mut self,
        filtered: &FilteredData,
        out: &mut BeamFormedData,
        subband: usize,
        center_frequency: f64,
        block: usize,
        first_beam: usize,
        nr_beams: usize,
    ) {
        // Every beam inherits the union of all contributing stations'
        // flags: one broken station dirties the coherent sum.
        let mut sum_flags = crate::data::FlagRanges::new(filtered.nr_samples());
        for m in 0..self.nr_merged_stations {
            sum_flags.union_with(&filtered.flags[m]);
        }

        if self.flys_eye {
            for beam in first_beam..first_beam + nr_beams {
                let src = filtered.samples.index_axis(Axis(0), beam);
                out.samples.index_axis_mut(Axis(0), beam).assign(&src);
                out.flags[beam] = filtered.flags[beam].clone();
            }
            out.block = Some(block);
            return;
        }

        self.update_weights(subband, center_frequency, block);
        let scale = 1.0 / self.nr_merged_stations as f32;
        let nr_merged = self.nr_merged_stations;
        let weights = &self.weights;
        let stations = filtered.samples.slice(ndarray::s![..nr_merged, .., .., ..]);

        out.samples
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .filter(|(beam, _)| (first_beam..first_beam + nr_beams).contains(beam))
            .for_each(|(beam, mut beam_samples)| {
                beam_samples.fill(c32::default());
                for s in 0..nr_merged {
                    let station = stations.index_axis(Axis(0), s);
                    for c in 0..self.nr_channels {
                        let w = weights[(beam, s, c)];
                        let src = station.index_axis(Axis(0), c);
                        let mut dst = beam_samples.index_axis_mut(Axis(0), c);
                        Zip::from(&mut dst).and(&src).for_each(|d, &x| *d += w * x);
                    }
                }
                beam_samples.mapv_inplace(|v| v * scale);
            });

        for beam in first_beam..first_beam + nr_beams {
            out.flags[beam] = sum_flags.clone();
        }
        out.block = Some(block);
    }

    /// Copy one (pencil, polarization) slice of the formed beams into a
    /// transpose payload, channel-major, re/im interleaved. This is the
    /// beam-major to subband-major reorder: the payload is what one
    /// phase-three rank receives for one subband.
    pub fn pre_transpose(
        &self,
        bf: &BeamFormedData,
        pencil: usize,
        pol: usize,
        payload: &mut [f32],
    ) {
        let samples = bf.samples.index_axis(Axis(0), pencil);
        let nr_samples = samples.shape()[1];
        assert_eq!(payload.len(), self.nr_channels * nr_samples * 2);
        let mut w = 0;
        for c in 0..self.nr_channels {
            for t in 0..nr_samples {
                let v = samples[(c, t, pol)];
                payload[w] = v.re;
                payload[w + 1] = v.im;
                w += 2;
            }
        }
    }
}

/// The receive-side counterpart of [`BeamFormer::pre_transpose`]: drop one
/// subband's payload into its row of the reassembly buffer.
pub fn post_transpose(payload: &[f32], data: &mut crate::data::TransposedBeamData, slot: usize) {
    data.words
        .row_mut(slot)
        .as_slice_mut()
        .expect("rows are contiguous")
        .copy_from_slice(payload);
    data.received[slot] = true;
}
