// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The main cnproc binary.

use log::error;

fn main() {
    match cnproc::cli::Cnproc::run() {
        Ok(()) => (),
        Err(e) => {
            error!("{e}");
            // The display chain may carry the useful part.
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            std::process::exit(1);
        }
    }
}
