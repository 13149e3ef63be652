// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The data sets flowing through the pipeline.

Each struct owns one block's worth of one data-set kind, allocated exactly
once (through the [`crate::arena::Arena`] for planned kinds) and reused
every block. The `block` marker records which block last wrote the buffer;
a data set whose compute-flag is off for a block keeps its old marker, so
tests can verify the buffer really went untouched.
 */

mod flags;

pub use flags::FlagRanges;

use ndarray::{Array2, Array3, Array4};

use crate::arena::Arena;
use crate::c32;
use crate::plan::ProductKind;

/// The two linear polarizations of a station datastream.
pub const NR_POLARIZATIONS: usize = 2;

/// Raw dual-polarization station samples for one block, plus the filter
/// history padding: `[slice][padded time][pol]`. Phase-one ranks hold one
/// slice per subband of their station; phase-two ranks stage one slice per
/// station of their subband.
#[derive(Debug)]
pub struct RawData {
    pub samples: Array3<c32>,

    /// Per slice, over the padded raw-time domain.
    pub flags: Vec<FlagRanges>,

    pub block: Option<usize>,
}

impl RawData {
    pub fn new(nr_slices: usize, padded_samples: usize) -> RawData {
        RawData {
            samples: Array3::zeros((nr_slices, padded_samples, NR_POLARIZATIONS)),
            flags: (0..nr_slices)
                .map(|_| FlagRanges::new(padded_samples))
                .collect(),
            block: None,
        }
    }
}

/// Channelized per-station samples: `[station][channel][time][pol]`.
#[derive(Debug)]
pub struct FilteredData {
    pub samples: Array4<c32>,

    /// Per station, over the channel-sample time domain. Channels share
    /// their station's time flags.
    pub flags: Vec<FlagRanges>,

    pub block: Option<usize>,
}

impl FilteredData {
    pub fn new(
        arena: &Arena,
        nr_stations: usize,
        nr_channels: usize,
        nr_samples: usize,
    ) -> FilteredData {
        let v = arena.allocate_c32(
            ProductKind::Filtered,
            nr_stations * nr_channels * nr_samples * NR_POLARIZATIONS,
        );
        FilteredData {
            samples: Array4::from_shape_vec(
                (nr_stations, nr_channels, nr_samples, NR_POLARIZATIONS),
                v,
            )
            .expect("allocation matches shape"),
            flags: (0..nr_stations).map(|_| FlagRanges::new(nr_samples)).collect(),
            block: None,
        }
    }

    pub fn nr_samples(&self) -> usize {
        self.samples.shape()[2]
    }
}

/// Visibilities of all baselines for one subband:
/// `[baseline][channel][pol1][pol2]`, with per-(baseline, channel) counts
/// of the samples that actually went in.
#[derive(Debug)]
pub struct CorrelatedData {
    pub visibilities: Array4<c32>,

    pub nr_valid_samples: Array2<u32>,

    /// Mean (fractional) time of the valid samples per baseline, for the
    /// fringe-stopping correction downstream; 0.5 when nothing is flagged.
    pub centroids: Vec<f32>,

    pub block: Option<usize>,
}

impl CorrelatedData {
    pub fn new(arena: &Arena, nr_baselines: usize, nr_channels: usize) -> CorrelatedData {
        let v = arena.allocate_c32(
            ProductKind::Correlated,
            nr_baselines * nr_channels * NR_POLARIZATIONS * NR_POLARIZATIONS,
        );
        CorrelatedData {
            visibilities: Array4::from_shape_vec(
                (
                    nr_baselines,
                    nr_channels,
                    NR_POLARIZATIONS,
                    NR_POLARIZATIONS,
                ),
                v,
            )
            .expect("allocation matches shape"),
            nr_valid_samples: Array2::from_shape_vec(
                (nr_baselines, nr_channels),
                arena.allocate_u32_extra(ProductKind::Correlated, nr_baselines * nr_channels),
            )
            .expect("allocation matches shape"),
            centroids: vec![0.0; nr_baselines],
            block: None,
        }
    }
}

/// Complex beam voltages: `[beam][channel][time][pol]`.
#[derive(Debug)]
pub struct BeamFormedData {
    pub samples: Array4<c32>,

    /// Per beam; a beam inherits the union of its contributing stations'
    /// flags.
    pub flags: Vec<FlagRanges>,

    pub block: Option<usize>,
}

impl BeamFormedData {
    pub fn new(
        arena: &Arena,
        nr_beams: usize,
        nr_channels: usize,
        nr_samples: usize,
    ) -> BeamFormedData {
        let v = arena.allocate_c32(
            ProductKind::BeamFormed,
            nr_beams * nr_channels * nr_samples * NR_POLARIZATIONS,
        );
        BeamFormedData {
            samples: Array4::from_shape_vec(
                (nr_beams, nr_channels, nr_samples, NR_POLARIZATIONS),
                v,
            )
            .expect("allocation matches shape"),
            flags: (0..nr_beams).map(|_| FlagRanges::new(nr_samples)).collect(),
            block: None,
        }
    }
}

/// Stokes powers: `[beam][component][channel][time / integration]`. The
/// incoherent calculator uses a single "beam".
#[derive(Debug)]
pub struct StokesData {
    pub powers: Array4<f32>,

    pub block: Option<usize>,
}

impl StokesData {
    pub fn new(
        arena: &Arena,
        kind: ProductKind,
        nr_beams: usize,
        nr_components: usize,
        nr_channels: usize,
        nr_samples: usize,
    ) -> StokesData {
        let v = arena.allocate_f32(
            kind,
            nr_beams * nr_components * nr_channels * nr_samples,
        );
        StokesData {
            powers: Array4::from_shape_vec(
                (nr_beams, nr_components, nr_channels, nr_samples),
                v,
            )
            .expect("allocation matches shape"),
            block: None,
        }
    }
}

/// One beam stream's words, reassembled in subband order on a phase-three
/// rank: `[subband within part][payload words]`.
#[derive(Debug)]
pub struct TransposedBeamData {
    pub words: Array2<f32>,

    /// Which subband slots arrived this block.
    pub received: Vec<bool>,

    /// False when the upstream marked the block invalid (missing input);
    /// the reassembled block then produces no output record.
    pub valid: bool,

    pub block: Option<usize>,
}

impl TransposedBeamData {
    pub fn new(nr_subbands: usize, words_per_subband: usize) -> TransposedBeamData {
        TransposedBeamData {
            words: Array2::zeros((nr_subbands, words_per_subband)),
            received: vec![false; nr_subbands],
            valid: true,
            block: None,
        }
    }

    pub fn reset(&mut self, block: usize) {
        self.received.iter_mut().for_each(|r| *r = false);
        self.valid = true;
        self.block = Some(block);
    }

    pub fn complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

/// A pulse detection for one beam stream and block.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerData {
    pub detected: bool,
    pub peak_power: f32,
    /// Sample index of the peak within the block.
    pub peak_sample: usize,
    pub mean_power: f32,
}
