// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all cnproc-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CnprocError {
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),

    #[error(transparent)]
    Plan(#[from] crate::plan::PlanError),

    #[error(transparent)]
    Transpose(#[from] crate::transpose::TransposeError),

    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error(transparent)]
    Record(#[from] crate::io::RecordError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
