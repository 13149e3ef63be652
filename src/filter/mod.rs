// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The polyphase filter bank.

Turns a station's raw samples into `nr_channels` critically-sampled complex
channels: a windowed-sinc prototype FIR, split into one branch per channel,
followed by an FFT across the branches. The input for a block carries
`taps - 1` channel samples of history from the previous block, so filtering
block-by-block is bit-identical to filtering the whole observation in one
pass regardless of which rank ends up with which block.

A 1-channel observation bypasses the bank entirely; channel 0 then carries
the raw samples unfiltered.
 */

#[cfg(test)]
mod tests;

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, ArrayViewMut3};
use rustfft::{Fft, FftPlanner};

use crate::c32;
use crate::data::{FlagRanges, NR_POLARIZATIONS};

/// The FIR coefficients, one branch per channel.
#[derive(Debug, Clone)]
pub struct FilterBank {
    /// `[channel][tap]`
    weights: Array2<f32>,
}

impl FilterBank {
    /// A Hamming-windowed sinc prototype low-pass, cut off at the channel
    /// width, split into polyphase branches. Scaled for unit DC gain per
    /// branch.
    pub fn new(nr_channels: usize, nr_taps: usize) -> FilterBank {
        let total = nr_channels * nr_taps;
        let mut prototype = vec![0.0f64; total];
        let mut sum = 0.0;
        for (i, w) in prototype.iter_mut().enumerate() {
            let x = i as f64 - (total - 1) as f64 / 2.0;
            let sinc = if x == 0.0 {
                1.0
            } else {
                let arg = PI * x / nr_channels as f64;
                arg.sin() / arg
            };
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / (total - 1).max(1) as f64).cos();
            *w = sinc * window;
            sum += *w;
        }
        // Unit gain for a DC input on every branch together.
        let scale = nr_channels as f64 / sum;

        let mut weights = Array2::zeros((nr_channels, nr_taps));
        for c in 0..nr_channels {
            for k in 0..nr_taps {
                weights[(c, k)] = (prototype[k * nr_channels + c] * scale) as f32;
            }
        }
        FilterBank { weights }
    }

    pub fn weights(&self) -> ArrayView2<f32> {
        self.weights.view()
    }
}

pub struct Ppf {
    nr_channels: usize,
    nr_taps: usize,
    nr_samples: usize,
    bank: FilterBank,
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<c32>,
}

impl Ppf {
    pub fn new(nr_channels: usize, nr_taps: usize, nr_samples: usize) -> Ppf {
        let mut planner = FftPlanner::new();
        Ppf {
            nr_channels,
            nr_taps,
            nr_samples,
            bank: FilterBank::new(nr_channels, nr_taps),
            fft: planner.plan_fft_forward(nr_channels),
            scratch: vec![c32::default(); nr_channels],
        }
    }

    /// Raw samples consumed per call, history padding included.
    pub fn nr_input_samples(&self) -> usize {
        (self.nr_samples + self.nr_taps - 1) * self.nr_channels
    }

    /// Channelize one station's block.
    ///
    /// `raw` is `[padded time][pol]` with `nr_input_samples()` rows and
    /// flagged samples already zeroed; `out` is `[channel][time][pol]`.
    /// The raw-domain flags are widened to every channel sample whose
    /// filter history touched them.
    pub fn filter(
        &mut self,
        raw: ArrayView2<c32>,
        raw_flags: &FlagRanges,
        mut out: ArrayViewMut3<c32>,
        out_flags: &mut FlagRanges,
    ) {
        assert_eq!(raw.shape(), [self.nr_input_samples(), NR_POLARIZATIONS]);
        assert_eq!(
            out.shape(),
            [self.nr_channels, self.nr_samples, NR_POLARIZATIONS]
        );

        if self.nr_channels == 1 {
            for t in 0..self.nr_samples {
                for pol in 0..NR_POLARIZATIONS {
                    out[(0, t, pol)] = raw[(t, pol)];
                }
            }
        } else {
            let weights = &self.bank.weights;
            for t in 0..self.nr_samples {
                for pol in 0..NR_POLARIZATIONS {
                    for c in 0..self.nr_channels {
                        let mut acc = c32::default();
                        for k in 0..self.nr_taps {
                            let w = weights[(c, k)];
                            acc += raw[((t + k) * self.nr_channels + c, pol)] * w;
                        }
                        self.scratch[c] = acc;
                    }
                    self.fft.process(&mut self.scratch);
                    // FFT bins come out DC-first; reorder so channel 0 is
                    // the bottom of the subband.
                    let half = self.nr_channels / 2;
                    for c in 0..self.nr_channels {
                        out[(c, t, pol)] = self.scratch[(c + half) % self.nr_channels];
                    }
                }
            }
        }

        *out_flags = raw_flags.channelized(self.nr_channels, self.nr_taps - 1, self.nr_samples);
    }
}
