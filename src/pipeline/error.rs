// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors that abort an observation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Transpose(#[from] crate::transpose::TransposeError),

    #[error(transparent)]
    Record(#[from] crate::io::RecordError),

    #[error("One or more ranks failed; the observation is aborted")]
    ObservationFailed,
}
