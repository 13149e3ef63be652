// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Stokes calculators.

Reduce dual-polarization complex voltages to power products, optionally
integrating consecutive samples in time. The coherent calculator works on
formed beams; the incoherent one averages station powers directly, skipping
stations whose block is entirely flagged.
 */


use ndarray::Axis;

use crate::c32;
use crate::context::StokesKind;
use crate::data::{BeamFormedData, FilteredData, StokesData};

#[inline]
fn stokes(kind: StokesKind, x: c32, y: c32, out: &mut [f32]) {
    let xx = x.norm_sqr();
    let yy = y.norm_sqr();
    match kind {
        StokesKind::I => out[0] += xx + yy,
        StokesKind::IQUV => {
            let xy = x * y.conj();
            out[0] += xx + yy;
            out[1] += xx - yy;
            out[2] += 2.0 * xy.re;
            out[3] += 2.0 * xy.im;
        }
        StokesKind::XXYY => {
            out[0] += xx;
            out[1] += yy;
        }
    }
}

pub struct StokesCalculator {
    kind: StokesKind,
    time_integration: usize,
    nr_channels: usize,
    nr_samples: usize,
}

impl StokesCalculator {
    pub fn new(
        kind: StokesKind,
        time_integration: usize,
        nr_channels: usize,
        nr_samples: usize,
    ) -> StokesCalculator {
        assert_eq!(nr_samples % time_integration, 0);
        StokesCalculator {
            kind,
            time_integration,
            nr_channels,
            nr_samples,
        }
    }

    pub fn nr_components(&self) -> usize {
        self.kind.nr_components()
    }

    pub fn nr_samples_out(&self) -> usize {
        self.nr_samples / self.time_integration
    }

    /// Stokes of the formed beams: `out[beam][component][channel][t]`.
    pub fn calculate_coherent(&self, bf: &BeamFormedData, out: &mut StokesData, block: usize) {
        let nr_beams = bf.samples.shape()[0];
        for beam in 0..nr_beams {
            let voltages = bf.samples.index_axis(Axis(0), beam);
            for c in 0..self.nr_channels {
                for t_out in 0..self.nr_samples_out() {
                    let mut acc = [0.0f32; 4];
                    for i in 0..self.time_integration {
                        let t = t_out * self.time_integration + i;
                        stokes(self.kind, voltages[(c, t, 0)], voltages[(c, t, 1)], &mut acc);
                    }
                    for comp in 0..self.nr_components() {
                        out.powers[(beam, comp, c, t_out)] = acc[comp];
                    }
                }
            }
        }
        out.block = Some(block);
    }

    /// Incoherent Stokes: station powers averaged over the merged stations
    /// whose block has any valid data. `out` uses a single "beam".
    pub fn calculate_incoherent(
        &self,
        filtered: &FilteredData,
        nr_merged_stations: usize,
        out: &mut StokesData,
        block: usize,
    ) {
        let used: Vec<usize> = (0..nr_merged_stations)
            .filter(|&s| !filtered.flags[s].all_flagged())
            .collect();
        let scale = if used.is_empty() {
            0.0
        } else {
            1.0 / used.len() as f32
        };

        for c in 0..self.nr_channels {
            for t_out in 0..self.nr_samples_out() {
                let mut acc = [0.0f32; 4];
                for &s in &used {
                    let voltages = filtered.samples.index_axis(Axis(0), s);
                    for i in 0..self.time_integration {
                        let t = t_out * self.time_integration + i;
                        stokes(self.kind, voltages[(c, t, 0)], voltages[(c, t, 1)], &mut acc);
                    }
                }
                for comp in 0..self.nr_components() {
                    out.powers[(0, comp, c, t_out)] = acc[comp] * scale;
                }
            }
        }
        out.block = Some(block);
    }

    /// Copy one (pencil, component) plane into a transpose payload,
    /// channel-major: what one phase-three rank receives for one subband.
    pub fn pre_transpose(
        &self,
        stokes: &StokesData,
        pencil: usize,
        component: usize,
        payload: &mut [f32],
    ) {
        assert_eq!(payload.len(), self.nr_channels * self.nr_samples_out());
        let plane = stokes.powers.index_axis(Axis(0), pencil);
        let plane = plane.index_axis(Axis(0), component);
        let mut w = 0;
        for c in 0..self.nr_channels {
            for t in 0..self.nr_samples_out() {
                payload[w] = plane[(c, t)];
                w += 1;
            }
        }
    }
}
