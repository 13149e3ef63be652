// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors for the fixed-layout record streams.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Bad record magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u16),

    #[error("Record is for station {found}, expected station {expected}")]
    WrongStation { found: usize, expected: usize },

    #[error("Record is for block {found}, expected block {expected}")]
    WrongBlock { found: usize, expected: usize },

    #[error("Record shape {found:?} doesn't match the observation's {expected:?}")]
    ShapeMismatch {
        found: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Record names unknown product kind {0}")]
    UnknownProduct(u8),

    #[error("No output stream open for {kind} stream {stream}")]
    StreamNotOpen {
        kind: crate::plan::ProductKind,
        stream: usize,
    },
}
