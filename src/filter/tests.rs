// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::{s, Array2, Array3};

use super::*;

fn tone(freq_cycles_per_raw_sample: f64, n: usize) -> Array2<c32> {
    let mut raw = Array2::zeros((n, NR_POLARIZATIONS));
    for t in 0..n {
        let phase = 2.0 * std::f64::consts::PI * freq_cycles_per_raw_sample * t as f64;
        let s = c32::new(phase.cos() as f32, phase.sin() as f32);
        raw[(t, 0)] = s;
        raw[(t, 1)] = s * 0.5;
    }
    raw
}

#[test]
fn branch_weights_sum_to_unit_gain() {
    let bank = FilterBank::new(16, 8);
    let total: f32 = bank.weights().iter().sum();
    assert_abs_diff_eq!(total, 16.0, epsilon = 1e-3);
}

#[test]
fn one_channel_passes_through() {
    let nr_samples = 32;
    let mut ppf = Ppf::new(1, 1, nr_samples);
    assert_eq!(ppf.nr_input_samples(), nr_samples);

    let raw = tone(0.1, nr_samples);
    let flags = FlagRanges::new(nr_samples);
    let mut out = Array3::zeros((1, nr_samples, NR_POLARIZATIONS));
    let mut out_flags = FlagRanges::new(nr_samples);
    ppf.filter(raw.view(), &flags, out.view_mut(), &mut out_flags);

    for t in 0..nr_samples {
        assert_eq!(out[(0, t, 0)], raw[(t, 0)]);
        assert_eq!(out[(0, t, 1)], raw[(t, 1)]);
    }
    assert!(out_flags.is_empty());
}

#[test]
fn tone_lands_in_its_channel() {
    let nr_channels = 8;
    let nr_taps = 4;
    let nr_samples = 64;
    let mut ppf = Ppf::new(nr_channels, nr_taps, nr_samples);

    // A tone in the middle of channel 6: channel index 6 is offset
    // (6 - 8/2) = +2 bins from DC, i.e. 2/8 cycles per raw sample.
    let raw = tone(2.0 / nr_channels as f64, ppf.nr_input_samples());
    let flags = FlagRanges::new(ppf.nr_input_samples());
    let mut out = Array3::zeros((nr_channels, nr_samples, NR_POLARIZATIONS));
    let mut out_flags = FlagRanges::new(nr_samples);
    ppf.filter(raw.view(), &flags, out.view_mut(), &mut out_flags);

    let power: Vec<f32> = (0..nr_channels)
        .map(|c| {
            out.slice(s![c, .., 0])
                .iter()
                .map(|v| v.norm_sqr())
                .sum::<f32>()
        })
        .collect();
    let best = power
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .unwrap()
        .0;
    assert_eq!(best, 6);
    // The tone channel dominates everything else by a wide margin.
    for (c, p) in power.iter().enumerate() {
        if c != best {
            assert!(p * 20.0 < power[best], "channel {c} leaks: {p}");
        }
    }
}

#[test]
fn blockwise_filtering_equals_one_pass() {
    let nr_channels = 4;
    let nr_taps = 4;
    let nr_samples = 16;
    let nr_blocks = 3;

    // One long pass over the whole stream...
    let total_samples = nr_blocks * nr_samples;
    let mut one_pass = Ppf::new(nr_channels, nr_taps, total_samples);
    let stream = tone(0.07, one_pass.nr_input_samples());
    let flags = FlagRanges::new(one_pass.nr_input_samples());
    let mut full = Array3::zeros((nr_channels, total_samples, NR_POLARIZATIONS));
    let mut full_flags = FlagRanges::new(total_samples);
    one_pass.filter(stream.view(), &flags, full.view_mut(), &mut full_flags);

    // ...must equal three block passes over overlapping windows.
    let mut blockwise = Ppf::new(nr_channels, nr_taps, nr_samples);
    let window = blockwise.nr_input_samples();
    for block in 0..nr_blocks {
        let first_raw = block * nr_samples * nr_channels;
        let raw = stream.slice(s![first_raw..first_raw + window, ..]);
        let raw_flags = FlagRanges::new(window);
        let mut out = Array3::zeros((nr_channels, nr_samples, NR_POLARIZATIONS));
        let mut out_flags = FlagRanges::new(nr_samples);
        blockwise.filter(raw, &raw_flags, out.view_mut(), &mut out_flags);

        let expected = full.slice(s![.., block * nr_samples..(block + 1) * nr_samples, ..]);
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-5);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-5);
        }
    }
}

#[test]
fn raw_flags_widen_to_filter_history() {
    let nr_channels = 4;
    let nr_taps = 4;
    let nr_samples = 16;
    let mut ppf = Ppf::new(nr_channels, nr_taps, nr_samples);

    let mut raw = tone(0.05, ppf.nr_input_samples());
    let mut flags = FlagRanges::new(ppf.nr_input_samples());
    // Raw samples 32..36 are dropped: channel sample 8, and the 3
    // preceding samples whose history windows cover it.
    flags.include(32..36);
    for t in 32..36 {
        raw[(t, 0)] = c32::default();
        raw[(t, 1)] = c32::default();
    }

    let mut out = Array3::zeros((nr_channels, nr_samples, NR_POLARIZATIONS));
    let mut out_flags = FlagRanges::new(nr_samples);
    ppf.filter(raw.view(), &flags, out.view_mut(), &mut out_flags);
    assert_eq!(out_flags.ranges(), &[(5, 9)]);
}
