// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Real-time correlator and beamformer pipeline for a LOFAR-style
radio-telescope array.

Every observation second is cut into fixed-size blocks. Phase-1 ranks read
raw station samples and scatter them by subband; phase-2 ranks channelize,
correlate, beamform and reduce to Stokes products; phase-3 ranks collect
beam parts and write output records. All work distribution is derived from
static configuration, so no rank ever needs to negotiate with another to
find its peers.
 */

pub mod arena;
pub mod beamform;
pub mod cli;
pub mod constants;
pub mod context;
pub mod correlator;
pub mod data;
pub mod dedispersion;
pub mod error;
pub mod filter;
pub mod flagging;
pub mod io;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod stokes;
pub mod topology;
pub mod transpose;

// Re-exports.
pub use context::Observation;
pub use error::CnprocError;
pub use pipeline::CnProcessing;
pub use plan::{ProcessingPlan, ProductKind};
pub use topology::{Locus, Topology};

/// A single-precision complex number; the unit of nearly every sample cube
/// in the pipeline.
#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex<f32>;
