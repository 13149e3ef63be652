// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors when reading or validating an observation parset.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Couldn't read parset file {0}")]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse parset file {0}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("nr_channels_per_subband ({0}) must be a power of two")]
    ChannelsNotPowerOfTwo(usize),

    #[error("cn_integration_steps must be non-zero")]
    ZeroIntegrationSteps,

    #[error("nr_ppf_taps must be non-zero")]
    ZeroPpfTaps,

    #[error("{product} time_integration ({factor}) must divide cn_integration_steps ({steps})")]
    IntegrationDoesntDivide {
        product: &'static str,
        factor: usize,
        steps: usize,
    },

    #[error("subbands_per_part must be non-zero")]
    ZeroSubbandsPerPart,

    #[error("Superstation '{superstation}' references unknown station '{station}'")]
    UnknownSuperstationMember {
        superstation: String,
        station: String,
    },

    #[error("Station '{station}' appears in more than one superstation")]
    DuplicateSuperstationMember { station: String },

    #[error("Phase {0} lists pset {1} more than once")]
    DuplicatePset(u8, usize),

    #[error("Phase {0} core index {1} is not below cores_per_pset ({2})")]
    CoreOutOfRange(u8, usize, usize),

    #[error(
        "Phase-three psets must either be disjoint from phase-two psets or identical to them"
    )]
    Phase3NeitherDisjunctNorShared,

    #[error("Phase-three shares psets with phase two but uses a different core list")]
    Phase3SharedCoreMismatch,

    #[error(
        "Both coherent_stokes and beam_formed outputs are enabled; an observation transposes one coherent product"
    )]
    BothCoherentProducts,

    #[error("Beam direction {0:?} has (near-)zero length")]
    ZeroLengthDirection([f64; 3]),

    #[error("An observation needs at least one beam per SAP when a coherent product is enabled")]
    NoBeams,
}
