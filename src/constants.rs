// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.

/// Speed of light \[m/s\].
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// The dispersion constant relating dispersion measure, frequency and pulse
/// delay: delay \[s\] = DM / (2.41e-4 * f^2) with f in MHz and DM in
/// pc cm^-3.
pub const DISPERSION_CONSTANT: f64 = 2.41e-4;

/// The default number of taps in the polyphase filter bank.
pub const DEFAULT_PPF_TAPS: usize = 16;

/// How many (first, len) flagged ranges a transpose packet can carry. Flag
/// ranges beyond this are merged into their predecessor, widening the flag;
/// over-flagging is always acceptable, dropping flags is not.
pub const MAX_FLAG_RANGES_PER_PACKET: usize = 16;

/// Payload buffers lent out per transpose destination. Two means a rank can
/// fill one buffer while the previous one is still in flight.
pub const TRANSPOSE_BUFFERS_PER_PEER: usize = 2;

/// How long a rank waits on a transpose receive before declaring the
/// observation dead. A missed block deadline means the data is useless, so
/// there is no retry, only abort.
pub const TRANSPOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
