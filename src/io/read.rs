// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Station sample input.

A phase-one rank performs one blocking record read per block per station.
Records are little-endian and fixed-layout; their shape mirrors the
in-memory [`crate::data::RawData`] cube. When the hardware (or file) has
nothing for a block, the previous buffer contents stay put and every sample
is flagged — missing input is a data-quality issue, never an error.

The fake source replaces the hardware entirely: a deterministic tone per
station, quantized like an ADC would, continuous across block boundaries so
filter-history overlap behaves exactly as with real input.
 */

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use bytemuck::Zeroable;
use byteorder::{LittleEndian, ReadBytesExt};
use static_assertions::const_assert_eq;

use crate::c32;
use crate::context::Observation;
use crate::data::{RawData, NR_POLARIZATIONS};

use super::RecordError;

pub const STATION_RECORD_MAGIC: u32 = 0x5354_414e; // "STAN"
pub const STATION_RECORD_VERSION: u16 = 1;

/// One raw dual-pol sample as it appears on the wire.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct WireSample {
    pub x_re: i16,
    pub x_im: i16,
    pub y_re: i16,
    pub y_im: i16,
}

const_assert_eq!(std::mem::size_of::<WireSample>(), 8);

/// Did a block read produce real data?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    Ok,
    /// Nothing arrived; the caller keeps stale samples and flags them all.
    Missing,
}

/// A station's sample feed. One implementation reads recorded files, one
/// fabricates data; the pipeline can't tell them apart.
pub trait SampleSource: Send {
    /// Blocking read of one block into `raw` (`[subband][padded time][pol]`).
    fn read_block(&mut self, block: usize, raw: &mut RawData) -> Result<InputStatus, RecordError>;
}

/// Deterministic synthetic input: per subband a tone in a fixed channel,
/// with a per-station phase offset so cross-correlations are non-trivial.
/// Values go through an i16 round-trip to mimic the station ADCs.
pub struct FakeSource {
    station: usize,
    nr_channels: usize,
    /// The channel (DC-relative bin) the test tone lands in.
    tone_channel: usize,
    samples_per_block: usize,
}

impl FakeSource {
    pub fn new(obs: &Observation, station: usize) -> FakeSource {
        let nr_channels = obs.nr_channels_per_subband;
        FakeSource {
            station,
            nr_channels,
            // One bin above DC, so channel mapping mistakes show up.
            tone_channel: if nr_channels == 1 {
                0
            } else {
                (nr_channels / 2 + 1).min(nr_channels - 1)
            },
            samples_per_block: obs.cn_integration_steps * obs.nr_channels_per_subband,
        }
    }

    fn sample(&self, subband: usize, global_index: usize) -> c32 {
        // Offset from DC in bins; tone_channel is an absolute channel
        // index with channel nr_channels/2 at DC.
        let bins = self.tone_channel as f64 - (self.nr_channels / 2) as f64;
        let cycles = bins / self.nr_channels as f64;
        let phase = 2.0 * std::f64::consts::PI * cycles * global_index as f64
            + 0.1 * self.station as f64
            + 0.01 * subband as f64;
        let amplitude = 512.0;
        let quantize = |v: f64| (v as i32).clamp(i16::MIN as i32, i16::MAX as i32) as f32;
        c32::new(
            quantize(amplitude * phase.cos()),
            quantize(amplitude * phase.sin()),
        )
    }
}

impl SampleSource for FakeSource {
    fn read_block(&mut self, block: usize, raw: &mut RawData) -> Result<InputStatus, RecordError> {
        let (nr_subbands, padded, _) = raw.samples.dim();
        for sb in 0..nr_subbands {
            for t in 0..padded {
                let global = block * self.samples_per_block + t;
                let v = self.sample(sb, global);
                raw.samples[(sb, t, 0)] = v;
                // The second polarization sees the same sky through a
                // 90-degree hybrid.
                raw.samples[(sb, t, 1)] = c32::new(-v.im, v.re);
            }
        }
        for f in raw.flags.iter_mut() {
            f.clear();
        }
        raw.block = Some(block);
        Ok(InputStatus::Ok)
    }
}

/// Reads consecutive station records from a file.
pub struct FileSource {
    station: usize,
    reader: BufReader<File>,
    expected_shape: (usize, usize),
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(
        path: P,
        obs: &Observation,
        station: usize,
    ) -> Result<FileSource, RecordError> {
        Ok(FileSource {
            station,
            reader: BufReader::new(File::open(path)?),
            expected_shape: (obs.nr_subbands(), obs.nr_samples_to_cn_proc()),
        })
    }
}

impl SampleSource for FileSource {
    fn read_block(&mut self, block: usize, raw: &mut RawData) -> Result<InputStatus, RecordError> {
        let magic = match self.reader.read_u32::<LittleEndian>() {
            Ok(m) => m,
            // A truncated feed is a dropout, not a failure.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(InputStatus::Missing),
            Err(e) => return Err(e.into()),
        };
        if magic != STATION_RECORD_MAGIC {
            return Err(RecordError::BadMagic {
                found: magic,
                expected: STATION_RECORD_MAGIC,
            });
        }
        let version = self.reader.read_u16::<LittleEndian>()?;
        if version != STATION_RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        let station = self.reader.read_u16::<LittleEndian>()? as usize;
        if station != self.station {
            return Err(RecordError::WrongStation {
                found: station,
                expected: self.station,
            });
        }
        let record_block = self.reader.read_u64::<LittleEndian>()? as usize;
        if record_block != block {
            return Err(RecordError::WrongBlock {
                found: record_block,
                expected: block,
            });
        }
        let nr_subbands = self.reader.read_u32::<LittleEndian>()? as usize;
        let nr_samples = self.reader.read_u32::<LittleEndian>()? as usize;
        if (nr_subbands, nr_samples) != self.expected_shape {
            return Err(RecordError::ShapeMismatch {
                found: vec![nr_subbands, nr_samples],
                expected: vec![self.expected_shape.0, self.expected_shape.1],
            });
        }

        let nr_ranges = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut ranges = Vec::with_capacity(nr_ranges);
        for _ in 0..nr_ranges {
            let s = self.reader.read_u32::<LittleEndian>()? as usize;
            let e = self.reader.read_u32::<LittleEndian>()? as usize;
            ranges.push((s, e));
        }

        let mut wire = vec![WireSample::zeroed(); nr_samples];
        for sb in 0..nr_subbands {
            self.reader
                .read_exact(bytemuck::cast_slice_mut(wire.as_mut_slice()))?;
            for (t, w) in wire.iter().enumerate() {
                raw.samples[(sb, t, 0)] = c32::new(w.x_re as f32, w.x_im as f32);
                raw.samples[(sb, t, 1)] = c32::new(w.y_re as f32, w.y_im as f32);
            }
        }

        for f in raw.flags.iter_mut() {
            f.clear();
            for &(s, e) in &ranges {
                f.include(s..e);
            }
        }
        raw.block = Some(block);
        Ok(InputStatus::Ok)
    }
}

/// Write one station record; the inverse of [`FileSource::read_block`].
/// Used by the record tooling and tests.
pub fn write_station_record<W: std::io::Write>(
    writer: &mut W,
    station: usize,
    block: usize,
    flags: &[(usize, usize)],
    samples: &ndarray::Array3<c32>,
) -> Result<(), RecordError> {
    use byteorder::WriteBytesExt;

    let (nr_subbands, nr_samples, nr_pols) = samples.dim();
    assert_eq!(nr_pols, NR_POLARIZATIONS);

    writer.write_u32::<LittleEndian>(STATION_RECORD_MAGIC)?;
    writer.write_u16::<LittleEndian>(STATION_RECORD_VERSION)?;
    writer.write_u16::<LittleEndian>(station as u16)?;
    writer.write_u64::<LittleEndian>(block as u64)?;
    writer.write_u32::<LittleEndian>(nr_subbands as u32)?;
    writer.write_u32::<LittleEndian>(nr_samples as u32)?;
    writer.write_u32::<LittleEndian>(flags.len() as u32)?;
    for &(s, e) in flags {
        writer.write_u32::<LittleEndian>(s as u32)?;
        writer.write_u32::<LittleEndian>(e as u32)?;
    }
    for sb in 0..nr_subbands {
        for t in 0..nr_samples {
            let x = samples[(sb, t, 0)];
            let y = samples[(sb, t, 1)];
            writer.write_i16::<LittleEndian>(x.re as i16)?;
            writer.write_i16::<LittleEndian>(x.im as i16)?;
            writer.write_i16::<LittleEndian>(y.re as i16)?;
            writer.write_i16::<LittleEndian>(y.im as i16)?;
        }
    }
    Ok(())
}
