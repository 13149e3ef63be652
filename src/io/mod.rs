// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Record input and output.

mod error;
pub mod read;
pub mod write;

pub use error::RecordError;
pub use read::{FakeSource, FileSource, InputStatus, SampleSource};
pub use write::{read_records, OutputRecord, OutputStreams, StreamRegistry};
