// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The per-rank orchestrator.

`CnProcessing` drives one rank through an observation: `preprocess` builds
the plan-derived state and allocates every real-time buffer, `process`
runs one block through the fixed stage order, `postprocess` tears down and
reports. The stage order is a consequence of the data dependencies and the
plan's compute flags guard each stage; there is no dependency graph at
runtime because the graph is fully known here, at (re)configuration time.

Within one block a rank:
  1. arms its phase-three receive expectations,
  2. arms its phase-two receive expectations,
  3. reads its stations' input and scatters it by subband,
  4. stages arriving station data, then channelizes, merges, dedisperses,
     flags, correlates and beamforms each owned subband, sending beam
     parts onward as soon as they exist,
  5. collects its owned beam streams, reassembles them in subband order
     and emits their records,
  6. waits for its own sends to drain, and
  7. advances the ring cursors.

Missing station input flags data and suppresses output records; it never
fails the block. A transpose failure aborts the observation: past the
block deadline the data is worthless, so there is nothing to recover.

[`run_observation`] is the reference deployment: every rank of the
partition as one thread in this process, wired through the in-process
fabrics.
 */

mod error;
#[cfg(test)]
mod tests;

pub use error::PipelineError;

use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, info};

use crate::arena::Arena;
use crate::beamform::{post_transpose, BeamFormer};
use crate::context::{DedispersionWhere, Observation};
use crate::correlator::Correlator;
use crate::data::{
    BeamFormedData, CorrelatedData, FilteredData, FlagRanges, RawData, StokesData,
    TransposedBeamData, TriggerData, NR_POLARIZATIONS,
};
use crate::dedispersion::Dedispersion;
use crate::filter::Ppf;
use crate::flagging::{PostCorrelationFlagger, PreCorrelationFlagger};
use crate::io::{FakeSource, FileSource, InputStatus, SampleSource, StreamRegistry};
use crate::metrics::Metrics;
use crate::plan::{ProcessingPlan, ProductKind};
use crate::stokes::StokesCalculator;
use crate::topology::{Rank, Ring, Roles, Topology};
use crate::transpose::{fabric, Endpoint};

/// Words of one input-exchange packet: the flag prefix plus one subband's
/// padded dual-pol samples.
pub fn input_packet_words(obs: &Observation) -> usize {
    FlagRanges::marshalled_words() + obs.nr_samples_to_cn_proc() * NR_POLARIZATIONS * 2
}

/// Words of one beam-exchange packet: one subband of one beam stream.
pub fn beam_packet_words(obs: &Observation, plan: &ProcessingPlan) -> Option<usize> {
    let kind = plan.transposed_kind()?;
    let words = match kind {
        ProductKind::CoherentStokes => {
            obs.nr_channels_per_subband
                * (obs.cn_integration_steps / obs.coherent_stokes.time_integration)
        }
        ProductKind::BeamFormed => {
            obs.nr_channels_per_subband * obs.cn_integration_steps * 2
        }
        _ => unreachable!("only coherent products are transposed"),
    };
    Some(words)
}

fn unit_nr(stream_or_station: usize, subband: usize, nr_subbands: usize) -> usize {
    stream_or_station * nr_subbands + subband
}

fn unit_parts(unit: usize, nr_subbands: usize) -> (usize, usize) {
    (unit / nr_subbands, unit % nr_subbands)
}

pub struct CnProcessing {
    obs: Arc<Observation>,
    topology: Arc<Topology>,
    plan: Arc<ProcessingPlan>,
    registry: Arc<StreamRegistry>,
    rank: Rank,
    roles: Roles,

    // Keeps the buffer accounting alive for the observation's lifetime.
    _arena: Option<Arena>,

    // Phase one.
    sources: Vec<Box<dyn SampleSource>>,
    station_raw: Vec<RawData>,

    // Phase two.
    subband_ring: Option<Ring>,
    staging: Vec<RawData>,
    staging_map: Vec<usize>,
    filtered: Option<FilteredData>,
    correlated: Option<CorrelatedData>,
    incoherent: Option<StokesData>,
    beam_formed: Option<BeamFormedData>,
    coherent: Option<StokesData>,

    ppf: Option<Ppf>,
    beam_former: Option<BeamFormer>,
    correlator: Option<Correlator>,
    coherent_calc: Option<StokesCalculator>,
    incoherent_calc: Option<StokesCalculator>,
    dedispersion: Option<(Dedispersion, DedispersionWhere)>,
    pre_flagger: Option<PreCorrelationFlagger>,
    post_flagger: Option<PostCorrelationFlagger>,

    // Phase three.
    beam_ring: Option<Ring>,
    owned_streams: Vec<usize>,
    transposed: Vec<TransposedBeamData>,

    input_endpoint: Option<Endpoint>,
    beam_endpoint: Option<Endpoint>,

    // Scratch for assembling output records; sized once.
    record_scratch: Vec<f32>,
    beam_scratch: Vec<f32>,

    metrics: Metrics,
}

impl CnProcessing {
    /// Build everything this rank needs for the observation: stage
    /// instances, arenas, output streams, ring cursors. All real-time
    /// buffers exist when this returns; `process` allocates nothing.
    pub fn preprocess(
        obs: Arc<Observation>,
        topology: Arc<Topology>,
        plan: Arc<ProcessingPlan>,
        registry: Arc<StreamRegistry>,
        rank: Rank,
        input_endpoint: Option<Endpoint>,
        beam_endpoint: Option<Endpoint>,
    ) -> Result<CnProcessing, PipelineError> {
        let roles = topology.roles(rank);
        debug!(
            "rank {rank}: stations {:?}, phase two: {}, phase three: {}",
            roles.stations, roles.phase_two, roles.phase_three
        );

        let nr_subbands = obs.nr_subbands();
        let nr_channels = obs.nr_channels_per_subband;
        let nr_samples = obs.nr_samples_per_channel();
        let padded = obs.nr_samples_to_cn_proc();

        // Phase one: one source and one raw buffer per owned station.
        let mut sources: Vec<Box<dyn SampleSource>> = Vec::new();
        let mut station_raw = Vec::new();
        for &station in &roles.stations {
            let source: Box<dyn SampleSource> = if obs.fake_input {
                Box::new(FakeSource::new(&obs, station))
            } else {
                let path = obs
                    .output_dir
                    .join(format!("{}.input", obs.station[station].name));
                Box::new(FileSource::open(path, &obs, station)?)
            };
            sources.push(source);
            station_raw.push(RawData::new(nr_subbands, padded));
        }

        // Phase two.
        let mut arena = None;
        let mut staging = Vec::new();
        let mut filtered = None;
        let mut correlated = None;
        let mut incoherent = None;
        let mut beam_formed = None;
        let mut coherent = None;
        let mut ppf = None;
        let mut beam_former = None;
        let mut correlator = None;
        let mut coherent_calc = None;
        let mut incoherent_calc = None;
        let mut dedispersion = None;
        let mut pre_flagger = None;
        let mut post_flagger = None;
        let mut subband_ring = None;
        let mut record_scratch = Vec::new();

        if roles.phase_two {
            let a = Arena::from_plan(&plan);
            let nr_cores = obs.phase_two.cores.len();
            let max_owned = div_ceil(topology.subbands_per_pset(), nr_cores);
            staging = (0..max_owned)
                .map(|_| RawData::new(obs.nr_stations(), padded))
                .collect();

            filtered = Some(FilteredData::new(&a, obs.nr_stations(), nr_channels, nr_samples));
            if plan.calculate(ProductKind::Correlated) {
                correlated = Some(CorrelatedData::new(&a, obs.nr_baselines(), nr_channels));
                correlator = Some(Correlator::new(&obs));
                record_scratch = vec![
                    0.0;
                    obs.nr_baselines() * nr_channels * NR_POLARIZATIONS * NR_POLARIZATIONS * 2
                        + obs.nr_baselines() * nr_channels
                        + obs.nr_baselines()
                ];
            }
            if plan.calculate(ProductKind::IncoherentStokes) {
                let settings = &obs.incoherent_stokes;
                incoherent = Some(StokesData::new(
                    &a,
                    ProductKind::IncoherentStokes,
                    1,
                    settings.kind.nr_components(),
                    nr_channels,
                    nr_samples / settings.time_integration,
                ));
                incoherent_calc = Some(StokesCalculator::new(
                    settings.kind,
                    settings.time_integration,
                    nr_channels,
                    nr_samples,
                ));
            }
            if plan.calculate(ProductKind::BeamFormed) {
                beam_formed = Some(BeamFormedData::new(
                    &a,
                    obs.nr_pencils(),
                    nr_channels,
                    nr_samples,
                ));
            }
            if plan.calculate(ProductKind::CoherentStokes) {
                let settings = &obs.coherent_stokes;
                coherent = Some(StokesData::new(
                    &a,
                    ProductKind::CoherentStokes,
                    obs.nr_pencils(),
                    settings.kind.nr_components(),
                    nr_channels,
                    nr_samples / settings.time_integration,
                ));
                coherent_calc = Some(StokesCalculator::new(
                    settings.kind,
                    settings.time_integration,
                    nr_channels,
                    nr_samples,
                ));
            }

            ppf = Some(Ppf::new(nr_channels, obs.effective_ppf_taps(), nr_samples));
            beam_former = Some(BeamFormer::new(&obs));

            if let Some(dd) = &obs.dedispersion {
                let pset_slot = topology.phase_two_pset_slot(rank).expect("phase-two rank");
                let spp = topology.subbands_per_pset();
                let pset_subbands: Vec<usize> = (pset_slot * spp
                    ..((pset_slot + 1) * spp).min(nr_subbands))
                    .collect();
                dedispersion = Some((
                    Dedispersion::new(&obs, dd.dispersion_measure, &pset_subbands),
                    dd.when,
                ));
            }
            if let Some(settings) = &obs.pre_flagger {
                pre_flagger = Some(PreCorrelationFlagger::new(settings, nr_samples));
            }
            if let Some(settings) = &obs.post_flagger {
                post_flagger = Some(PostCorrelationFlagger::new(
                    settings,
                    obs.nr_baselines(),
                    nr_channels,
                ));
            }

            let core_slot = topology.phase_two_core_slot(rank).expect("phase-two rank");
            subband_ring = Some(Ring::subbands(&topology, core_slot));
            arena = Some(a);
        }

        // Phase three.
        let mut beam_ring = None;
        let mut transposed = Vec::new();
        let mut beam_scratch = Vec::new();
        if roles.phase_three {
            let core_slot = topology
                .phase_three_core_slot(rank)
                .expect("phase-three rank");
            beam_ring = Some(Ring::streams(&topology, core_slot));
            let nr_cores = obs
                .phase_three
                .as_ref()
                .map(|p| p.cores.len())
                .unwrap_or(1);
            let max_owned = div_ceil(topology.streams_per_pset(), nr_cores).max(1);
            let words = beam_packet_words(&obs, &plan).expect("phase three implies a transpose");
            transposed = (0..max_owned)
                .map(|_| TransposedBeamData::new(obs.subbands_per_part(), words))
                .collect();
            beam_scratch = vec![0.0; words];
        }
        if roles.phase_two && plan.transposed_kind().is_some() && beam_scratch.is_empty() {
            beam_scratch = vec![0.0; beam_packet_words(&obs, &plan).unwrap()];
        }

        Ok(CnProcessing {
            obs,
            topology,
            plan,
            registry,
            rank,
            roles,
            _arena: arena,
            sources,
            station_raw,
            subband_ring,
            staging,
            staging_map: Vec::new(),
            filtered,
            correlated,
            incoherent,
            beam_formed,
            coherent,
            ppf,
            beam_former,
            correlator,
            coherent_calc,
            incoherent_calc,
            dedispersion,
            pre_flagger,
            post_flagger,
            beam_ring,
            owned_streams: Vec::new(),
            transposed,
            input_endpoint,
            beam_endpoint,
            record_scratch,
            beam_scratch,
            metrics: Metrics::new(),
        })
    }

    /// The subbands this rank owns at the ring's current block.
    fn owned_subbands_now(&self) -> Vec<usize> {
        let ring = match &self.subband_ring {
            Some(ring) => ring,
            None => return Vec::new(),
        };
        let pset_slot = self
            .topology
            .phase_two_pset_slot(self.rank)
            .expect("phase-two rank");
        let spp = self.topology.subbands_per_pset();
        ring.owned()
            .into_iter()
            .map(|slot| pset_slot * spp + slot)
            .filter(|&sb| sb < self.obs.nr_subbands())
            .collect()
    }

    fn owned_streams_now(&self) -> Vec<usize> {
        let ring = match &self.beam_ring {
            Some(ring) => ring,
            None => return Vec::new(),
        };
        let pset_slot = self
            .topology
            .phase_three_pset_slot(self.rank)
            .expect("phase-three rank");
        let stpp = self.topology.streams_per_pset();
        ring.owned()
            .into_iter()
            .map(|slot| pset_slot * stpp + slot)
            .filter(|&st| st < self.obs.nr_beam_streams())
            .collect()
    }

    /// Run one block through the pipeline.
    pub fn process(&mut self, block: usize) -> Result<(), PipelineError> {
        let nr_subbands = self.obs.nr_subbands();

        // (1) Phase three arms its expectations before anyone sends.
        if self.roles.phase_three {
            self.owned_streams = self.owned_streams_now();
            for data in self.transposed.iter_mut() {
                data.reset(block);
            }
            let mut expected = Vec::new();
            for &stream in &self.owned_streams {
                let part = self.topology.decompose_stream_nr(stream).part;
                for sb in self.obs.part_subbands(part) {
                    let owner = self
                        .topology
                        .subband_owner(sb, block)
                        .expect("subband in range");
                    let src = self.topology.rank_of(owner);
                    if src != self.rank {
                        expected.push((src, unit_nr(stream, sb, nr_subbands)));
                    }
                }
            }
            self.beam_endpoint
                .as_mut()
                .expect("phase three uses the beam fabric")
                .post_all_receives(block, &expected);
        }

        // (2) Phase two arms its input expectations.
        if self.roles.phase_two {
            self.staging_map = self.owned_subbands_now();
            let mut expected = Vec::new();
            for &sb in &self.staging_map {
                for station in 0..self.obs.nr_stations() {
                    let owner = self.topology.station_owner(station).expect("station in range");
                    let src = self.topology.rank_of(owner);
                    if src != self.rank {
                        expected.push((src, unit_nr(station, sb, nr_subbands)));
                    }
                }
            }
            self.input_endpoint
                .as_mut()
                .expect("phase two uses the input fabric")
                .post_all_receives(block, &expected);
        }

        // (3) Phase one: read stations, scatter by subband.
        self.read_and_scatter(block)?;

        // (4) Phase two: stage arrivals, then process each owned subband.
        if self.roles.phase_two {
            self.receive_station_data()?;
            for slot in 0..self.staging_map.len() {
                let sb = self.staging_map[slot];
                self.process_subband(block, slot, sb)?;
            }
        }

        // (5) Phase three: collect beam parts, reassemble, emit.
        if self.roles.phase_three {
            self.receive_beam_data()?;
            for i in 0..self.owned_streams.len() {
                self.emit_beam_stream(block, i)?;
            }
        }

        // (6) Drain our own sends before the next block reuses buffers.
        if let Some(endpoint) = self.input_endpoint.as_mut() {
            endpoint.wait_for_all_sends()?;
        }
        if let Some(endpoint) = self.beam_endpoint.as_mut() {
            endpoint.wait_for_all_sends()?;
        }

        // (7) Advance the cursors.
        if let Some(ring) = self.subband_ring.as_mut() {
            ring.advance();
        }
        if let Some(ring) = self.beam_ring.as_mut() {
            ring.advance();
        }
        Ok(())
    }

    fn read_and_scatter(&mut self, block: usize) -> Result<(), PipelineError> {
        let nr_subbands = self.obs.nr_subbands();
        let padded = self.obs.nr_samples_to_cn_proc();
        let stations = self.roles.stations.clone();
        for (i, &station) in stations.iter().enumerate() {
            let status = self.metrics.time("input read", || {
                self.sources[i].read_block(block, &mut self.station_raw[i])
            })?;
            if status == InputStatus::Missing {
                // Keep whatever samples are in the buffer, but flag them.
                info!("rank {}: no input for station {station} block {block}", self.rank);
                for flags in self.station_raw[i].flags.iter_mut() {
                    flags.flag_all();
                }
            }

            for sb in 0..nr_subbands {
                let owner = self
                    .topology
                    .subband_owner(sb, block)
                    .expect("subband in range");
                let dst = self.topology.rank_of(owner);
                let unit = unit_nr(station, sb, nr_subbands);
                if dst == self.rank {
                    // Local delivery: straight into our own staging.
                    let slot = self
                        .staging_map
                        .iter()
                        .position(|&s| s == sb)
                        .expect("we own this subband");
                    let raw = &self.station_raw[i];
                    let staging = &mut self.staging[slot];
                    for t in 0..padded {
                        for pol in 0..NR_POLARIZATIONS {
                            staging.samples[(station, t, pol)] = raw.samples[(sb, t, pol)];
                        }
                    }
                    staging.flags[station] = raw.flags[sb].clone();
                    zero_flagged(staging, station);
                    staging.block = Some(block);
                } else {
                    let raw = &self.station_raw[i];
                    let prefix = FlagRanges::marshalled_words();
                    self.input_endpoint
                        .as_mut()
                        .expect("phase one uses the input fabric")
                        .async_send(dst, block, unit, true, |payload| {
                            raw.flags[sb].marshall(&mut payload[..prefix]);
                            let mut w = prefix;
                            for t in 0..padded {
                                for pol in 0..NR_POLARIZATIONS {
                                    let v = raw.samples[(sb, t, pol)];
                                    payload[w] = v.re;
                                    payload[w + 1] = v.im;
                                    w += 2;
                                }
                            }
                        })?;
                }
            }
        }
        Ok(())
    }

    fn receive_station_data(&mut self) -> Result<(), PipelineError> {
        let nr_subbands = self.obs.nr_subbands();
        let padded = self.obs.nr_samples_to_cn_proc();
        let prefix = FlagRanges::marshalled_words();
        let endpoint = self.input_endpoint.as_mut().expect("phase-two rank");
        while endpoint.nr_pending() > 0 {
            let received = endpoint.wait_for_any_receive()?;
            let (station, sb) = unit_parts(received.unit, nr_subbands);
            let slot = self
                .staging_map
                .iter()
                .position(|&s| s == sb)
                .expect("expectation set only names owned subbands");
            let staging = &mut self.staging[slot];
            let payload = received.payload();
            staging.flags[station] = FlagRanges::unmarshall(&payload[..prefix], padded);
            let mut w = prefix;
            for t in 0..padded {
                for pol in 0..NR_POLARIZATIONS {
                    staging.samples[(station, t, pol)] =
                        crate::c32::new(payload[w], payload[w + 1]);
                    w += 2;
                }
            }
            zero_flagged(staging, station);
            staging.block = Some(received.block);
        }
        Ok(())
    }

    /// The phase-two compute chain for one owned subband.
    fn process_subband(
        &mut self,
        block: usize,
        slot: usize,
        sb: usize,
    ) -> Result<(), PipelineError> {
        let obs = &self.obs;
        let plan = &self.plan;
        let nr_stations = obs.nr_stations();
        let nr_channels = obs.nr_channels_per_subband;
        let nr_samples = obs.nr_samples_per_channel();
        let timestamp = obs.block_epoch(block);
        let frequency = obs.subband_frequency(sb);

        let staging = &self.staging[slot];
        let filtered = self.filtered.as_mut().expect("phase-two rank");
        let ppf = self.ppf.as_mut().expect("phase-two rank");

        // Channelize every station.
        self.metrics.time("ppf", || {
            for station in 0..nr_stations {
                let raw = staging.samples.index_axis(ndarray::Axis(0), station);
                let (out, out_flags) = (
                    filtered.samples.index_axis_mut(ndarray::Axis(0), station),
                    &mut filtered.flags[station],
                );
                ppf.filter(raw, &staging.flags[station], out, out_flags);
            }
        });
        filtered.block = Some(block);

        let beam_former = self.beam_former.as_mut().expect("phase-two rank");
        let nr_merged = beam_former.nr_merged_stations();
        self.metrics
            .time("station merge", || beam_former.merge_stations(filtered));

        // A block with no usable samples at all is skipped, not failed;
        // the gap shows up as absent output records.
        let has_data = (0..nr_merged).any(|s| !filtered.flags[s].all_flagged());

        if let Some((dd, DedispersionWhere::BeforeBeamforming)) = self.dedispersion.as_mut() {
            self.metrics
                .time("dedispersion", || dd.dedisperse_stations(filtered, sb, nr_merged));
        }

        if let Some(flagger) = self.pre_flagger.as_mut() {
            self.metrics
                .time("pre flagging", || flagger.flag(filtered, nr_merged));
        }

        if plan.output(ProductKind::Filtered) {
            if has_data {
                let merged = filtered
                    .samples
                    .slice(ndarray::s![..nr_merged, .., .., ..]);
                let words: &[f32] =
                    bytemuck::cast_slice(merged.to_slice().expect("leading slice is contiguous"));
                self.registry.write_record(
                    ProductKind::Filtered,
                    sb,
                    block,
                    timestamp,
                    &[nr_merged, nr_channels, nr_samples, NR_POLARIZATIONS, 2],
                    words,
                )?;
            } else {
                self.registry.skip_block(ProductKind::Filtered, sb, block)?;
            }
        }

        if plan.calculate(ProductKind::Correlated) {
            let correlator = self.correlator.as_ref().expect("correlated is planned");
            let corr = self.correlated.as_mut().expect("correlated is planned");
            self.metrics.time("correlate", || {
                correlator.compute_flags_and_centroids(filtered, corr);
                correlator.correlate(filtered, corr, block);
            });
            if let Some(flagger) = self.post_flagger.as_mut() {
                let rank = self.rank;
                self.metrics.time("post flagging", || {
                    let summary = flagger.flag(corr, nr_merged);
                    if summary.nr_flagged_visibilities > 0 {
                        debug!(
                            "rank {rank}: block {block} subband {sb}: flagged {} visibilities",
                            summary.nr_flagged_visibilities
                        );
                    }
                });
            }
            if plan.output(ProductKind::Correlated) {
                if has_data {
                    let nr_baselines = obs.nr_baselines();
                    let vis_words = nr_baselines * nr_channels * 4 * 2;
                    let scratch = &mut self.record_scratch;
                    scratch[..vis_words].copy_from_slice(bytemuck::cast_slice(
                        corr.visibilities.as_slice().expect("owned array"),
                    ));
                    let mut w = vis_words;
                    for &v in corr.nr_valid_samples.iter() {
                        scratch[w] = v as f32;
                        w += 1;
                    }
                    scratch[w..w + nr_baselines].copy_from_slice(&corr.centroids);
                    w += nr_baselines;
                    self.registry.write_record(
                        ProductKind::Correlated,
                        sb,
                        block,
                        timestamp,
                        // Visibilities first; weights and centroids trail.
                        &[w],
                        &scratch[..w],
                    )?;
                } else {
                    self.registry
                        .skip_block(ProductKind::Correlated, sb, block)?;
                }
            }
        }

        if plan.calculate(ProductKind::IncoherentStokes) {
            let calc = self.incoherent_calc.as_ref().expect("incoherent is planned");
            let out = self.incoherent.as_mut().expect("incoherent is planned");
            self.metrics.time("incoherent stokes", || {
                calc.calculate_incoherent(filtered, nr_merged, out, block)
            });
            if plan.output(ProductKind::IncoherentStokes) {
                if has_data {
                    self.registry.write_record(
                        ProductKind::IncoherentStokes,
                        sb,
                        block,
                        timestamp,
                        &[
                            calc.nr_components(),
                            nr_channels,
                            calc.nr_samples_out(),
                        ],
                        out.powers.as_slice().expect("owned array"),
                    )?;
                } else {
                    self.registry
                        .skip_block(ProductKind::IncoherentStokes, sb, block)?;
                }
            }
        }

        if plan.calculate(ProductKind::BeamFormed) {
            let bf = self.beam_formed.as_mut().expect("beams are planned");
            self.metrics.time("beamform", || {
                beam_former.form_beams(
                    filtered,
                    bf,
                    sb,
                    frequency,
                    block,
                    0,
                    obs.nr_pencils(),
                )
            });
            if let Some((dd, DedispersionWhere::AfterBeamforming)) = self.dedispersion.as_mut() {
                self.metrics
                    .time("dedispersion", || dd.dedisperse_beams(bf, sb));
            }
            if plan.calculate(ProductKind::CoherentStokes) {
                let calc = self.coherent_calc.as_ref().expect("coherent is planned");
                let out = self.coherent.as_mut().expect("coherent is planned");
                self.metrics
                    .time("coherent stokes", || calc.calculate_coherent(bf, out, block));
            }
            self.send_beam_parts(block, sb, has_data)?;
        }

        Ok(())
    }

    /// Scatter this subband's slice of every beam stream to the stream
    /// owners.
    fn send_beam_parts(
        &mut self,
        block: usize,
        sb: usize,
        has_data: bool,
    ) -> Result<(), PipelineError> {
        let obs = &self.obs;
        let nr_subbands = obs.nr_subbands();
        let nr_parts = obs.nr_parts();
        let nr_components = obs.nr_coherent_components();
        let transposed_kind = self.plan.transposed_kind().expect("beams are planned");
        let coherent_calc = self.coherent_calc.as_ref();
        let beam_former = self.beam_former.as_ref();
        let coherent = self.coherent.as_ref();
        let bf = self.beam_formed.as_ref();

        for stream in 0..obs.nr_beam_streams() {
            let part = stream % nr_parts;
            if !obs.part_subbands(part).contains(&sb) {
                continue;
            }
            let rest = stream / nr_parts;
            let component = rest % nr_components;
            let pencil = rest / nr_components;

            let owner = self
                .topology
                .beam_owner(stream, block)
                .expect("stream in range");
            let dst = self.topology.rank_of(owner);
            let unit = unit_nr(stream, sb, nr_subbands);

            // The beam-major to subband-major reorder: one payload is one
            // subband's slice of one stream, filled from whichever data
            // set crosses the transpose. Used for both remote sends and
            // local delivery.
            let fill = |payload: &mut [f32]| match transposed_kind {
                ProductKind::CoherentStokes => coherent_calc
                    .expect("coherent is planned")
                    .pre_transpose(coherent.expect("planned"), pencil, component, payload),
                ProductKind::BeamFormed => beam_former
                    .expect("phase-two rank")
                    .pre_transpose(bf.expect("planned"), pencil, component, payload),
                _ => unreachable!(),
            };

            if dst == self.rank {
                let i = self
                    .owned_streams
                    .iter()
                    .position(|&s| s == stream)
                    .expect("owner arithmetic is consistent");
                let row = sb - obs.part_subbands(part).start;
                fill(&mut self.beam_scratch);
                post_transpose(&self.beam_scratch, &mut self.transposed[i], row);
                self.transposed[i].valid &= has_data;
            } else {
                self.beam_endpoint
                    .as_mut()
                    .expect("beam products use the beam fabric")
                    .async_send(dst, block, unit, has_data, fill)?;
            }
        }
        Ok(())
    }

    fn receive_beam_data(&mut self) -> Result<(), PipelineError> {
        let nr_subbands = self.obs.nr_subbands();
        let endpoint = self.beam_endpoint.as_mut().expect("phase-three rank");
        while endpoint.nr_pending() > 0 {
            let received = endpoint.wait_for_any_receive()?;
            let (stream, sb) = unit_parts(received.unit, nr_subbands);
            let i = self
                .owned_streams
                .iter()
                .position(|&s| s == stream)
                .expect("expectation set only names owned streams");
            let part = self.topology.decompose_stream_nr(stream).part;
            let row = sb - self.obs.part_subbands(part).start;
            self.metrics.time("reassemble", || {
                post_transpose(received.payload(), &mut self.transposed[i], row);
            });
            self.transposed[i].valid &= received.valid;
        }
        Ok(())
    }

    /// Emit the records of one reassembled beam stream.
    fn emit_beam_stream(&mut self, block: usize, i: usize) -> Result<(), PipelineError> {
        let obs = &self.obs;
        let stream = self.owned_streams[i];
        let data = &self.transposed[i];
        let part = self.topology.decompose_stream_nr(stream).part;
        let nr_subbands_in_part = obs.part_subbands(part).len();
        let words_per_subband = data.words.shape()[1];
        let transposed_kind = self.plan.transposed_kind().expect("phase-three rank");
        let timestamp = obs.block_epoch(block);

        // Only the rows of real subbands count (the last part can be
        // short).
        let nr_received = data.received[..nr_subbands_in_part]
            .iter()
            .filter(|&&r| r)
            .count();
        debug_assert_eq!(nr_received, nr_subbands_in_part, "receive loop drained");

        if !data.valid {
            if self.plan.output(transposed_kind) {
                self.registry.skip_block(transposed_kind, stream, block)?;
            }
            if self.plan.output(ProductKind::Trigger) {
                self.registry
                    .skip_block(ProductKind::Trigger, stream, block)?;
            }
            return Ok(());
        }

        if self.plan.output(transposed_kind) {
            let nr_channels = obs.nr_channels_per_subband;
            let dims: Vec<usize> = match transposed_kind {
                ProductKind::CoherentStokes => vec![
                    nr_subbands_in_part,
                    nr_channels,
                    obs.cn_integration_steps / obs.coherent_stokes.time_integration,
                ],
                ProductKind::BeamFormed => vec![
                    nr_subbands_in_part,
                    nr_channels,
                    obs.cn_integration_steps,
                    2,
                ],
                _ => unreachable!(),
            };
            let words =
                &data.words.as_slice().expect("owned array")[..nr_subbands_in_part * words_per_subband];
            self.registry
                .write_record(transposed_kind, stream, block, timestamp, &dims, words)?;
        }

        if self.plan.calculate(ProductKind::Trigger) {
            let trigger = self.metrics.time("trigger", || {
                detect_pulse(
                    &self.transposed[i],
                    nr_subbands_in_part,
                    obs.nr_channels_per_subband,
                    obs.trigger.as_ref().map(|t| t.threshold).unwrap_or(8.0),
                )
            });
            self.registry.write_record(
                ProductKind::Trigger,
                stream,
                block,
                timestamp,
                &[4],
                &[
                    if trigger.detected { 1.0 } else { 0.0 },
                    trigger.peak_power,
                    trigger.peak_sample as f32,
                    trigger.mean_power,
                ],
            )?;
        }
        Ok(())
    }

    /// Tear down: flush metrics. The registry is shared and closed by the
    /// observation runner once every rank is done.
    pub fn postprocess(self) -> Result<(), PipelineError> {
        self.metrics.log_summary(self.rank);
        Ok(())
    }
}

/// Zero a staged station's flagged samples so the filter bank never sees
/// garbage values.
fn zero_flagged(staging: &mut RawData, station: usize) {
    let ranges: Vec<(usize, usize)> = staging.flags[station].ranges().to_vec();
    for (s, e) in ranges {
        for t in s..e {
            for pol in 0..NR_POLARIZATIONS {
                staging.samples[(station, t, pol)] = crate::c32::default();
            }
        }
    }
}

/// Pulse detection over one reassembled coherent-Stokes stream: the summed
/// power per output sample against the block mean.
fn detect_pulse(
    data: &TransposedBeamData,
    nr_subbands: usize,
    nr_channels: usize,
    threshold: f32,
) -> TriggerData {
    let words_per_subband = data.words.shape()[1];
    let nr_samples = words_per_subband / nr_channels;
    let mut series = vec![0.0f32; nr_samples];
    for sb in 0..nr_subbands {
        let row = data.words.row(sb);
        for c in 0..nr_channels {
            for t in 0..nr_samples {
                series[t] += row[c * nr_samples + t];
            }
        }
    }
    let mean = series.iter().sum::<f32>() / nr_samples as f32;
    let (peak_sample, &peak_power) = series
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .expect("series is non-empty");
    TriggerData {
        detected: peak_power > threshold * mean && mean > 0.0,
        peak_power,
        peak_sample,
        mean_power: mean,
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Run a whole observation in this process: one thread per rank, wired
/// through in-process fabrics. The reference deployment, and what the
/// `run` subcommand executes.
pub fn run_observation(obs: &Arc<Observation>) -> Result<(), PipelineError> {
    let topology = Arc::new(Topology::new(obs));
    let plan = Arc::new(ProcessingPlan::new(obs).map_err(|e| {
        error!("configuration is inconsistent: {e}");
        PipelineError::ObservationFailed
    })?);
    plan.log_summary();

    let registry = Arc::new(StreamRegistry::new(&obs.output_dir));
    for item in plan.items() {
        if !item.output {
            continue;
        }
        for stream in 0..plan.nr_output_streams(item.kind, obs) {
            registry.open(item.kind, stream).map_err(|e| {
                error!("can't open output stream {}.{stream:03}: {e}", item.kind);
                PipelineError::ObservationFailed
            })?;
        }
    }

    let nr_ranks = topology.nr_ranks();
    let mut input_endpoints: Vec<Option<Endpoint>> =
        fabric(nr_ranks, input_packet_words(obs)).into_iter().map(Some).collect();
    let mut beam_endpoints: Vec<Option<Endpoint>> = match beam_packet_words(obs, &plan) {
        Some(words) => fabric(nr_ranks, words).into_iter().map(Some).collect(),
        None => (0..nr_ranks).map(|_| None).collect(),
    };

    let failed = AtomicCell::new(false);
    std::thread::scope(|scope| {
        for rank in 0..nr_ranks {
            if topology.roles(rank).is_idle() {
                continue;
            }
            let obs = Arc::clone(obs);
            let topology = Arc::clone(&topology);
            let plan = Arc::clone(&plan);
            let registry = Arc::clone(&registry);
            let input_endpoint = input_endpoints[rank].take();
            let beam_endpoint = beam_endpoints[rank].take();
            let failed = &failed;
            scope.spawn(move || {
                let result = (|| -> Result<(), PipelineError> {
                    let mut cn = CnProcessing::preprocess(
                        obs.clone(),
                        topology,
                        plan,
                        registry,
                        rank,
                        input_endpoint,
                        beam_endpoint,
                    )?;
                    for block in 0..obs.nr_blocks {
                        if failed.load() {
                            break;
                        }
                        cn.process(block)?;
                    }
                    cn.postprocess()
                })();
                if let Err(e) = result {
                    error!("rank {rank}: {e}");
                    failed.store(true);
                }
            });
        }
    });

    // Endpoints of idle ranks die here; every worker has finished.
    drop(input_endpoints);
    drop(beam_endpoints);

    if failed.load() {
        return Err(PipelineError::ObservationFailed);
    }
    Arc::try_unwrap(registry)
        .map_err(|_| PipelineError::ObservationFailed)
        .and_then(|r| r.close().map_err(PipelineError::from))?;
    info!("observation '{}' completed", obs.name);
    Ok(())
}
