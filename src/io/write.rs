// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Output record streams.

One numbered stream per output product: per-subband products stream by
subband, beam products by beam stream number. A stream gets at most one
record per block, written fire-and-forget; consumers key off the record
header (block, timestamp, shape), never off cross-stream arrival order.
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hifitime::Epoch;
use indexmap::IndexMap;
use log::{debug, trace};
use strum::IntoEnumIterator;

use crate::plan::ProductKind;

use super::RecordError;

pub const OUTPUT_RECORD_MAGIC: u32 = 0x434e_5250; // "CNRP"
pub const OUTPUT_RECORD_VERSION: u16 = 1;

fn product_tag(kind: ProductKind) -> u8 {
    ProductKind::iter().position(|k| k == kind).unwrap() as u8
}

fn product_from_tag(tag: u8) -> Option<ProductKind> {
    ProductKind::iter().nth(tag as usize)
}

/// The per-rank set of open output streams.
pub struct OutputStreams {
    dir: PathBuf,
    sinks: IndexMap<(ProductKind, usize), BufWriter<File>>,
}

impl OutputStreams {
    pub fn new<P: AsRef<Path>>(dir: P) -> OutputStreams {
        OutputStreams {
            dir: dir.as_ref().to_path_buf(),
            sinks: IndexMap::new(),
        }
    }

    /// Create the file behind one (product, stream) pair. Called from
    /// `preprocess` for every stream this rank can ever write.
    pub fn open(&mut self, kind: ProductKind, stream: usize) -> Result<(), RecordError> {
        let path = self.dir.join(format!("{kind}.{stream:03}.raw"));
        debug!("opening output stream {kind}.{stream:03} at {}", path.display());
        let file = File::create(path)?;
        self.sinks.insert((kind, stream), BufWriter::new(file));
        Ok(())
    }

    pub fn is_open(&self, kind: ProductKind, stream: usize) -> bool {
        self.sinks.contains_key(&(kind, stream))
    }

    /// Write one record. Fire and forget: no acknowledgement, no retry.
    pub fn write_record(
        &mut self,
        kind: ProductKind,
        stream: usize,
        block: usize,
        timestamp: Epoch,
        dims: &[usize],
        words: &[f32],
    ) -> Result<(), RecordError> {
        let sink = self
            .sinks
            .get_mut(&(kind, stream))
            .ok_or(RecordError::StreamNotOpen { kind, stream })?;
        debug_assert_eq!(dims.iter().product::<usize>(), words.len());
        trace!("{kind}.{stream:03}: block {block}, {} words", words.len());

        sink.write_u32::<LittleEndian>(OUTPUT_RECORD_MAGIC)?;
        sink.write_u16::<LittleEndian>(OUTPUT_RECORD_VERSION)?;
        sink.write_u8(product_tag(kind))?;
        sink.write_u8(dims.len() as u8)?;
        sink.write_u32::<LittleEndian>(stream as u32)?;
        sink.write_u64::<LittleEndian>(block as u64)?;
        sink.write_f64::<LittleEndian>(timestamp.to_gpst_seconds())?;
        for &d in dims {
            sink.write_u32::<LittleEndian>(d as u32)?;
        }
        sink.write_u64::<LittleEndian>(words.len() as u64)?;
        for &w in words {
            sink.write_f32::<LittleEndian>(w)?;
        }
        Ok(())
    }

    /// Flush everything; the stream files stay valid if the process dies
    /// later.
    pub fn close(mut self) -> Result<(), RecordError> {
        for ((kind, stream), sink) in self.sinks.iter_mut() {
            trace!("closing output stream {kind}.{stream:03}");
            sink.flush()?;
        }
        Ok(())
    }
}

/// The shared, rank-facing front of the output streams.
///
/// Subband and stream ownership rotate over cores from block to block, so
/// consecutive records of one stream come from different ranks, possibly
/// out of order. The registry restores the per-stream guarantee: records
/// reach the sink in block order, while different streams may lag each
/// other freely. A rank that produces nothing for a block must say so
/// ([`StreamRegistry::skip_block`]) — a silent gap would stall the stream.
pub struct StreamRegistry {
    inner: std::sync::Mutex<RegistryInner>,
}

struct RegistryInner {
    streams: OutputStreams,
    next_block: IndexMap<(ProductKind, usize), usize>,
    held: IndexMap<(ProductKind, usize), std::collections::BTreeMap<usize, HeldRecord>>,
    skipped: IndexMap<(ProductKind, usize), std::collections::BTreeSet<usize>>,
}

struct HeldRecord {
    timestamp: Epoch,
    dims: Vec<usize>,
    words: Vec<f32>,
}

impl StreamRegistry {
    pub fn new<P: AsRef<Path>>(dir: P) -> StreamRegistry {
        StreamRegistry {
            inner: std::sync::Mutex::new(RegistryInner {
                streams: OutputStreams::new(dir),
                next_block: IndexMap::new(),
                held: IndexMap::new(),
                skipped: IndexMap::new(),
            }),
        }
    }

    pub fn open(&self, kind: ProductKind, stream: usize) -> Result<(), RecordError> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams.open(kind, stream)?;
        inner.next_block.insert((kind, stream), 0);
        inner.held.insert((kind, stream), Default::default());
        inner.skipped.insert((kind, stream), Default::default());
        Ok(())
    }

    pub fn is_open(&self, kind: ProductKind, stream: usize) -> bool {
        self.inner.lock().unwrap().streams.is_open(kind, stream)
    }

    pub fn write_record(
        &self,
        kind: ProductKind,
        stream: usize,
        block: usize,
        timestamp: Epoch,
        dims: &[usize],
        words: &[f32],
    ) -> Result<(), RecordError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.streams.is_open(kind, stream) {
            return Err(RecordError::StreamNotOpen { kind, stream });
        }
        inner.held.get_mut(&(kind, stream)).unwrap().insert(
            block,
            HeldRecord {
                timestamp,
                dims: dims.to_vec(),
                words: words.to_vec(),
            },
        );
        inner.drain(kind, stream)
    }

    /// This block legitimately produces no record for the stream (missing
    /// input); later blocks may pass it.
    pub fn skip_block(
        &self,
        kind: ProductKind,
        stream: usize,
        block: usize,
    ) -> Result<(), RecordError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.streams.is_open(kind, stream) {
            return Err(RecordError::StreamNotOpen { kind, stream });
        }
        inner
            .skipped
            .get_mut(&(kind, stream))
            .unwrap()
            .insert(block);
        inner.drain(kind, stream)
    }

    pub fn close(self) -> Result<(), RecordError> {
        let mut inner = self.inner.into_inner().unwrap();
        // Whatever is still held is in block order per stream by BTreeMap
        // construction; flush it out.
        let keys: Vec<(ProductKind, usize)> = inner.held.keys().copied().collect();
        for (kind, stream) in keys {
            let held = std::mem::take(inner.held.get_mut(&(kind, stream)).unwrap());
            for (block, record) in held {
                inner.streams.write_record(
                    kind,
                    stream,
                    block,
                    record.timestamp,
                    &record.dims,
                    &record.words,
                )?;
            }
        }
        inner.streams.close()
    }
}

impl RegistryInner {
    fn drain(&mut self, kind: ProductKind, stream: usize) -> Result<(), RecordError> {
        let next = self.next_block.get_mut(&(kind, stream)).unwrap();
        let held = self.held.get_mut(&(kind, stream)).unwrap();
        let skipped = self.skipped.get_mut(&(kind, stream)).unwrap();
        loop {
            if let Some(record) = held.remove(next) {
                self.streams.write_record(
                    kind,
                    stream,
                    *next,
                    record.timestamp,
                    &record.dims,
                    &record.words,
                )?;
                *next += 1;
            } else if skipped.remove(next) {
                *next += 1;
            } else {
                return Ok(());
            }
        }
    }
}

/// One output record, read back; the test-side mirror of
/// [`OutputStreams::write_record`].
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub kind: ProductKind,
    pub stream: usize,
    pub block: usize,
    pub timestamp_gpst: f64,
    pub dims: Vec<usize>,
    pub words: Vec<f32>,
}

/// Read every record in a stream file.
pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<OutputRecord>, RecordError> {
    let mut reader = std::io::BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    loop {
        let magic = match reader.read_u32::<LittleEndian>() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if magic != OUTPUT_RECORD_MAGIC {
            return Err(RecordError::BadMagic {
                found: magic,
                expected: OUTPUT_RECORD_MAGIC,
            });
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version != OUTPUT_RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        let tag = reader.read_u8()?;
        let kind = product_from_tag(tag).ok_or(RecordError::UnknownProduct(tag))?;
        let nr_dims = reader.read_u8()? as usize;
        let stream = reader.read_u32::<LittleEndian>()? as usize;
        let block = reader.read_u64::<LittleEndian>()? as usize;
        let timestamp_gpst = reader.read_f64::<LittleEndian>()?;
        let mut dims = Vec::with_capacity(nr_dims);
        for _ in 0..nr_dims {
            dims.push(reader.read_u32::<LittleEndian>()? as usize);
        }
        let nr_words = reader.read_u64::<LittleEndian>()? as usize;
        let mut words = vec![0.0f32; nr_words];
        for w in words.iter_mut() {
            *w = reader.read_f32::<LittleEndian>()?;
        }
        records.push(OutputRecord {
            kind,
            stream,
            block,
            timestamp_gpst,
            dims,
            words,
        });
    }
    Ok(records)
}
