// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The pset/core grid and the ownership functions.

Every rank computes the same pure functions over (static configuration,
block number) to decide who does what. These functions are the correctness
backbone of the transpose: a sender derives its receiver's rank from the
same arithmetic the receiver uses to derive its own work list, so no
metadata ever needs to be exchanged.

Phase-three ownership comes in two deliberately separate flavours,
[`Topology::beam_owner_disjunct`] and [`Topology::beam_owner_shared`],
rather than one function with a mode branch inside; which one applies is
decided once, from the pset lists, and recorded in the topology.
 */

use crate::context::{Observation, Phase3Mode};

/// A rank's global index: `pset * cores_per_pset + core`.
pub type Rank = usize;

/// A (pset, core) pair: the two-level address of one compute core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locus {
    pub pset: usize,
    pub core: usize,
}

/// The psets and cores of one phase.
#[derive(Debug, Clone)]
struct PhaseGrid {
    /// Pset ids, in parset order.
    psets: Vec<usize>,
    /// Core ids used within each of those psets.
    cores: Vec<usize>,
}

impl PhaseGrid {
    fn contains(&self, locus: Locus) -> bool {
        self.psets.contains(&locus.pset) && self.cores.contains(&locus.core)
    }
}

/// The decomposed form of a beam stream number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParts {
    pub sap: usize,
    pub beam: usize,
    /// Stokes component, or polarization for complex-voltage output.
    pub component: usize,
    pub part: usize,
}

/// What a rank does: any combination of reading stations (phase one),
/// subband processing (phase two) and beam reassembly (phase three).
#[derive(Debug, Clone, Default)]
pub struct Roles {
    /// The stations this rank reads and scatters. Usually zero or one.
    pub stations: Vec<usize>,
    pub phase_two: bool,
    pub phase_three: bool,
}

impl Roles {
    pub fn is_idle(&self) -> bool {
        self.stations.is_empty() && !self.phase_two && !self.phase_three
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    cores_per_pset: usize,
    nr_psets: usize,

    phase_one: PhaseGrid,
    phase_two: PhaseGrid,
    phase_three: Option<PhaseGrid>,
    phase_three_mode: Phase3Mode,

    nr_stations: usize,
    nr_subbands: usize,
    nr_beam_streams: usize,

    /// Beams per SAP, for flattening (sap, beam) into a pencil index.
    beams_per_sap: Vec<usize>,
    nr_coherent_components: usize,
    nr_parts: usize,

    /// Subbands a single phase-two pset carries (the last pset may carry
    /// fewer).
    subbands_per_pset: usize,
    /// Beam streams a single phase-three pset carries.
    streams_per_pset: usize,
}

impl Topology {
    pub fn new(obs: &Observation) -> Topology {
        let phase_one = PhaseGrid {
            psets: obs.phase_one.psets.to_vec(),
            cores: obs.phase_one.cores.to_vec(),
        };
        let phase_two = PhaseGrid {
            psets: obs.phase_two.psets.to_vec(),
            cores: obs.phase_two.cores.to_vec(),
        };
        let phase_three_mode = obs.phase_three_mode();
        let phase_three = match phase_three_mode {
            Phase3Mode::None => None,
            _ => obs.phase_three.as_ref().map(|p| PhaseGrid {
                psets: p.psets.to_vec(),
                cores: p.cores.to_vec(),
            }),
        };

        let nr_psets = phase_one
            .psets
            .iter()
            .chain(phase_two.psets.iter())
            .chain(phase_three.iter().flat_map(|g| g.psets.iter()))
            .max()
            .map(|&p| p + 1)
            .unwrap_or(0);

        let nr_subbands = obs.nr_subbands();
        let subbands_per_pset = div_ceil(nr_subbands, phase_two.psets.len());

        let nr_beam_streams = obs.nr_beam_streams();
        let streams_per_pset = match &phase_three {
            Some(g) if nr_beam_streams > 0 => div_ceil(nr_beam_streams, g.psets.len()),
            _ => 0,
        };

        Topology {
            cores_per_pset: obs.cores_per_pset,
            nr_psets,
            phase_one,
            phase_two,
            phase_three,
            phase_three_mode,
            nr_stations: obs.nr_stations(),
            nr_subbands,
            nr_beam_streams,
            // In fly's-eye mode every merged station is a pencil of one
            // implicit SAP; the SAP table doesn't apply.
            beams_per_sap: if obs.fly_s_eye {
                vec![obs.nr_merged_stations()]
            } else {
                obs.sap.iter().map(|s| s.beam.len()).collect()
            },
            nr_coherent_components: obs.nr_coherent_components(),
            nr_parts: obs.nr_parts(),
            subbands_per_pset,
            streams_per_pset,
        }
    }

    pub fn nr_ranks(&self) -> usize {
        self.nr_psets * self.cores_per_pset
    }

    pub fn rank_of(&self, locus: Locus) -> Rank {
        locus.pset * self.cores_per_pset + locus.core
    }

    pub fn locus_of(&self, rank: Rank) -> Locus {
        Locus {
            pset: rank / self.cores_per_pset,
            core: rank % self.cores_per_pset,
        }
    }

    pub fn phase_three_mode(&self) -> Phase3Mode {
        self.phase_three_mode
    }

    pub fn subbands_per_pset(&self) -> usize {
        self.subbands_per_pset
    }

    pub fn streams_per_pset(&self) -> usize {
        self.streams_per_pset
    }

    /// Which rank reads a station's samples. Static round-robin over the
    /// phase-one grid, psets first so consecutive stations land on
    /// different I/O nodes.
    pub fn station_owner(&self, station: usize) -> Option<Locus> {
        if station >= self.nr_stations {
            return None;
        }
        let np = self.phase_one.psets.len();
        let nc = self.phase_one.cores.len();
        Some(Locus {
            pset: self.phase_one.psets[station % np],
            core: self.phase_one.cores[(station / np) % nc],
        })
    }

    /// The per-block rotation stride of the phase-two core assignment.
    ///
    /// When phase three shares phase two's cores, both phases rotate over
    /// the cores as one combined slot sequence (subband slots first, then
    /// stream slots), so a subband and a beam stream never land on the same
    /// rotation position within a block.
    fn phase_two_stride(&self) -> usize {
        match self.phase_three_mode {
            Phase3Mode::Shared => self.subbands_per_pset + self.streams_per_pset,
            _ => self.subbands_per_pset,
        }
    }

    /// Which rank processes a subband in a given block.
    ///
    /// Subbands are split contiguously over the phase-two psets; within a
    /// pset the used cores take turns from block to block, so a core gets
    /// several block periods to finish one block's work.
    pub fn subband_owner(&self, subband: usize, block: usize) -> Option<Locus> {
        if subband >= self.nr_subbands || self.nr_subbands == 0 {
            return None;
        }
        let spp = self.subbands_per_pset;
        let pset_idx = subband / spp;
        let slot = subband % spp;
        let nc = self.phase_two.cores.len();
        let core = self.phase_two.cores[(block * self.phase_two_stride() + slot) % nc];
        Some(Locus {
            pset: self.phase_two.psets[pset_idx],
            core,
        })
    }

    /// Which rank reassembles a beam stream in a given block, when phase
    /// three runs on its own psets.
    ///
    /// Mirrors [`Topology::subband_owner`]: streams split contiguously over
    /// the phase-three psets, cores rotating per block.
    pub fn beam_owner_disjunct(&self, stream: usize, block: usize) -> Option<Locus> {
        let grid = self.phase_three.as_ref()?;
        if stream >= self.nr_beam_streams {
            return None;
        }
        let stpp = self.streams_per_pset;
        let pset_idx = stream / stpp;
        let slot = stream % stpp;
        let nc = grid.cores.len();
        let core = grid.cores[(block * stpp + slot) % nc];
        Some(Locus {
            pset: grid.psets[pset_idx],
            core,
        })
    }

    /// Which rank reassembles a beam stream in a given block, when phase
    /// three shares phase two's cores.
    ///
    /// The rotation stride covers both the subband slots and the stream
    /// slots, and the stream slots sit behind the subband slots, so a core
    /// is never asked to do a block's subband work and beam work from the
    /// same rotation position. Keeping this arithmetic separate from the
    /// disjunct variant keeps both independently testable.
    pub fn beam_owner_shared(&self, stream: usize, block: usize) -> Option<Locus> {
        let grid = self.phase_three.as_ref()?;
        if stream >= self.nr_beam_streams {
            return None;
        }
        let spp = self.subbands_per_pset;
        let stpp = self.streams_per_pset;
        let pset_idx = stream / stpp;
        let slot = stream % stpp;
        let nc = grid.cores.len();
        let core = grid.cores[(block * (spp + stpp) + spp + slot) % nc];
        Some(Locus {
            pset: grid.psets[pset_idx],
            core,
        })
    }

    /// The beam owner under whichever phase-three mode this observation
    /// runs. The mode is fixed at construction; the two variants stay
    /// separate functions.
    pub fn beam_owner(&self, stream: usize, block: usize) -> Option<Locus> {
        match self.phase_three_mode {
            Phase3Mode::None => None,
            Phase3Mode::Disjunct => self.beam_owner_disjunct(stream, block),
            Phase3Mode::Shared => self.beam_owner_shared(stream, block),
        }
    }

    /// Flatten (sap, beam, component, part) into a beam stream number.
    pub fn stream_nr(&self, sap: usize, beam: usize, component: usize, part: usize) -> usize {
        let pencil: usize = self.beams_per_sap[..sap].iter().sum::<usize>() + beam;
        (pencil * self.nr_coherent_components + component) * self.nr_parts + part
    }

    /// The inverse of [`Topology::stream_nr`].
    pub fn decompose_stream_nr(&self, stream: usize) -> StreamParts {
        let part = stream % self.nr_parts;
        let rest = stream / self.nr_parts;
        let component = rest % self.nr_coherent_components;
        let mut pencil = rest / self.nr_coherent_components;
        let mut sap = 0;
        for &n in &self.beams_per_sap {
            if pencil < n {
                break;
            }
            pencil -= n;
            sap += 1;
        }
        StreamParts {
            sap,
            beam: pencil,
            component,
            part,
        }
    }

    pub fn roles(&self, rank: Rank) -> Roles {
        let locus = self.locus_of(rank);
        let stations = (0..self.nr_stations)
            .filter(|&s| self.station_owner(s) == Some(locus))
            .collect();
        Roles {
            stations,
            phase_two: self.phase_two.contains(locus),
            phase_three: self
                .phase_three
                .as_ref()
                .map(|g| g.contains(locus))
                .unwrap_or(false),
        }
    }

    /// The position of a rank's core in the phase-two core list, if it is
    /// in the phase-two grid.
    pub fn phase_two_core_slot(&self, rank: Rank) -> Option<usize> {
        let locus = self.locus_of(rank);
        if !self.phase_two.psets.contains(&locus.pset) {
            return None;
        }
        self.phase_two.cores.iter().position(|&c| c == locus.core)
    }

    /// The index of a rank's pset in the phase-two pset list.
    pub fn phase_two_pset_slot(&self, rank: Rank) -> Option<usize> {
        let locus = self.locus_of(rank);
        self.phase_two.psets.iter().position(|&p| p == locus.pset)
    }

    pub fn phase_three_core_slot(&self, rank: Rank) -> Option<usize> {
        let grid = self.phase_three.as_ref()?;
        let locus = self.locus_of(rank);
        if !grid.psets.contains(&locus.pset) {
            return None;
        }
        grid.cores.iter().position(|&c| c == locus.core)
    }

    pub fn phase_three_pset_slot(&self, rank: Rank) -> Option<usize> {
        let grid = self.phase_three.as_ref()?;
        let locus = self.locus_of(rank);
        grid.psets.iter().position(|&p| p == locus.pset)
    }

    /// The subbands a phase-two rank owns in a block, in ascending order.
    /// Multiple subbands land on one core when a pset carries more subbands
    /// than it has cores; ascending order keeps every rank's send/receive
    /// sequence consistent.
    pub fn owned_subbands(&self, rank: Rank, block: usize) -> Vec<usize> {
        let (pset_slot, core_slot) = match (
            self.phase_two_pset_slot(rank),
            self.phase_two_core_slot(rank),
        ) {
            (Some(p), Some(c)) => (p, c),
            _ => return Vec::new(),
        };
        let spp = self.subbands_per_pset;
        let stride = self.phase_two_stride();
        let nc = self.phase_two.cores.len();
        (0..spp)
            .filter(|slot| (block * stride + slot) % nc == core_slot)
            .map(|slot| pset_slot * spp + slot)
            .filter(|&sb| sb < self.nr_subbands)
            .collect()
    }

    /// The beam streams a phase-three rank owns in a block, ascending.
    pub fn owned_streams(&self, rank: Rank, block: usize) -> Vec<usize> {
        if self.phase_three_mode == Phase3Mode::None {
            return Vec::new();
        }
        let (pset_slot, core_slot) = match (
            self.phase_three_pset_slot(rank),
            self.phase_three_core_slot(rank),
        ) {
            (Some(p), Some(c)) => (p, c),
            _ => return Vec::new(),
        };
        let stpp = self.streams_per_pset;
        let spp = self.subbands_per_pset;
        let nc = self.phase_three.as_ref().unwrap().cores.len();
        (0..stpp)
            .filter(|slot| {
                let rotation = match self.phase_three_mode {
                    Phase3Mode::Disjunct => block * stpp + slot,
                    Phase3Mode::Shared => block * (spp + stpp) + spp + slot,
                    Phase3Mode::None => unreachable!(),
                };
                rotation % nc == core_slot
            })
            .map(|slot| pset_slot * stpp + slot)
            .filter(|&st| st < self.nr_beam_streams)
            .collect()
    }
}

/// The per-rank round-robin cursor: the only mutable scheduling state a
/// rank carries. Advancing it must stay consistent with the pure owner
/// functions; `owned` is just the rank-local view of the same arithmetic.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Slots this rank's pset carries (subbands or beam streams).
    slots_per_pset: usize,
    /// Rotation stride per block.
    stride: usize,
    /// Rotation offset of slot 0 at block 0.
    offset: usize,
    nr_cores: usize,
    core_slot: usize,
    block: usize,
}

impl Ring {
    /// A cursor over phase-two subband slots.
    pub fn subbands(topology: &Topology, core_slot: usize) -> Ring {
        Ring {
            slots_per_pset: topology.subbands_per_pset,
            stride: topology.phase_two_stride(),
            offset: 0,
            nr_cores: topology.phase_two.cores.len(),
            core_slot,
            block: 0,
        }
    }

    /// A cursor over phase-three stream slots.
    pub fn streams(topology: &Topology, core_slot: usize) -> Ring {
        let (stride, offset) = match topology.phase_three_mode {
            Phase3Mode::Shared => (
                topology.subbands_per_pset + topology.streams_per_pset,
                topology.subbands_per_pset,
            ),
            _ => (topology.streams_per_pset, 0),
        };
        Ring {
            slots_per_pset: topology.streams_per_pset,
            stride,
            offset,
            nr_cores: topology
                .phase_three
                .as_ref()
                .map(|g| g.cores.len())
                .unwrap_or(1),
            core_slot,
            block: 0,
        }
    }

    pub fn block(&self) -> usize {
        self.block
    }

    /// The pset-relative slots this rank owns at the cursor's current
    /// block, ascending.
    pub fn owned(&self) -> Vec<usize> {
        (0..self.slots_per_pset)
            .filter(|slot| (self.block * self.stride + self.offset + slot) % self.nr_cores == self.core_slot)
            .collect()
    }

    pub fn advance(&mut self) {
        self.block += 1;
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use vec1::vec1;

    use super::*;
    use crate::context::tests::small_observation;
    use crate::context::PhasePartition;

    #[test]
    fn every_subband_owned_exactly_once_per_block() {
        let obs = small_observation();
        let topology = Topology::new(&obs);
        for block in 0..8 {
            let mut owners = HashSet::new();
            for sb in 0..obs.nr_subbands() {
                let owner = topology.subband_owner(sb, block).unwrap();
                // Determinism.
                assert_eq!(topology.subband_owner(sb, block), Some(owner));
                owners.insert((sb, owner));
            }
            assert_eq!(owners.len(), obs.nr_subbands());
        }
    }

    #[test]
    fn owned_subbands_matches_subband_owner() {
        let obs = small_observation();
        let topology = Topology::new(&obs);
        for block in 0..8 {
            let mut from_ranks: Vec<(usize, Locus)> = Vec::new();
            for rank in 0..topology.nr_ranks() {
                for sb in topology.owned_subbands(rank, block) {
                    from_ranks.push((sb, topology.locus_of(rank)));
                }
            }
            from_ranks.sort_by_key(|&(sb, _)| sb);
            let expected: Vec<(usize, Locus)> = (0..obs.nr_subbands())
                .map(|sb| (sb, topology.subband_owner(sb, block).unwrap()))
                .collect();
            assert_eq!(from_ranks, expected);
        }
    }

    #[test]
    fn round_robin_covers_cores() {
        // One pset, one subband, four cores: the owning core must cycle
        // through all four cores over four blocks.
        let mut obs = small_observation();
        obs.subbands = vec1![100];
        let topology = Topology::new(&obs);
        let cores: HashSet<usize> = (0..4)
            .map(|block| topology.subband_owner(0, block).unwrap().core)
            .collect();
        assert_eq!(cores.len(), 4);
    }

    #[test]
    fn no_subbands_means_no_owner() {
        let obs = small_observation();
        let topology = Topology::new(&obs);
        assert_eq!(topology.subband_owner(obs.nr_subbands(), 0), None);
    }

    #[test]
    fn beam_owner_disjunct_unique_and_deterministic() {
        let mut obs = small_observation();
        obs.coherent_stokes.subbands_per_part = Some(1); // 2 streams
        let topology = Topology::new(&obs);
        for block in 0..8 {
            let mut seen = HashSet::new();
            for st in 0..obs.nr_beam_streams() {
                let owner = topology.beam_owner_disjunct(st, block).unwrap();
                assert_eq!(topology.beam_owner_disjunct(st, block), Some(owner));
                // Phase 3 lives on pset 1 in the test observation.
                assert_eq!(owner.pset, 1);
                seen.insert((st, owner));
            }
            assert_eq!(seen.len(), obs.nr_beam_streams());
        }
    }

    #[test]
    fn beam_owner_shared_avoids_subband_slots() {
        let mut obs = small_observation();
        obs.phase_three = Some(obs.phase_two.clone());
        obs.coherent_stokes.subbands_per_part = Some(1);
        let topology = Topology::new(&obs);
        assert_eq!(topology.phase_three_mode(), Phase3Mode::Shared);

        // 2 subband slots + 2 stream slots over 4 shared cores: within any
        // block all four land on different cores, and the beam owners sit
        // on the phase-two psets.
        for block in 0..8 {
            let mut cores = HashSet::new();
            for sb in 0..obs.nr_subbands() {
                cores.insert(topology.subband_owner(sb, block).unwrap().core);
            }
            for st in 0..obs.nr_beam_streams() {
                let owner = topology.beam_owner_shared(st, block).unwrap();
                assert_eq!(topology.beam_owner_shared(st, block), Some(owner));
                assert_eq!(owner.pset, 0);
                cores.insert(owner.core);
            }
            assert_eq!(cores.len(), 4, "block {block}");
        }
    }

    #[test]
    fn owned_streams_matches_beam_owner() {
        for shared in [false, true] {
            let mut obs = small_observation();
            if shared {
                obs.phase_three = Some(obs.phase_two.clone());
            }
            obs.coherent_stokes.subbands_per_part = Some(1);
            let topology = Topology::new(&obs);
            for block in 0..8 {
                let mut from_ranks: Vec<(usize, Locus)> = Vec::new();
                for rank in 0..topology.nr_ranks() {
                    for st in topology.owned_streams(rank, block) {
                        from_ranks.push((st, topology.locus_of(rank)));
                    }
                }
                from_ranks.sort_by_key(|&(st, _)| st);
                let expected: Vec<(usize, Locus)> = (0..obs.nr_beam_streams())
                    .map(|st| (st, topology.beam_owner(st, block).unwrap()))
                    .collect();
                assert_eq!(from_ranks, expected, "shared={shared} block={block}");
            }
        }
    }

    #[test]
    fn stream_nr_roundtrip() {
        let mut obs = small_observation();
        obs.sap = vec![
            crate::context::Sap {
                direction: [0.0, 0.0, 1.0],
                beam: vec![
                    crate::context::Beam {
                        offset: [0.0, 0.0, 0.0],
                    },
                    crate::context::Beam {
                        offset: [0.01, 0.0, 0.0],
                    },
                ],
            },
            crate::context::Sap {
                direction: [0.1, 0.0, 1.0],
                beam: vec![crate::context::Beam {
                    offset: [0.0, 0.0, 0.0],
                }],
            },
        ];
        obs.coherent_stokes.kind = crate::context::StokesKind::IQUV;
        obs.coherent_stokes.subbands_per_part = Some(1);
        let topology = Topology::new(&obs);
        let mut seen = HashSet::new();
        for sap in 0..2 {
            let beams = if sap == 0 { 2 } else { 1 };
            for beam in 0..beams {
                for component in 0..4 {
                    for part in 0..2 {
                        let stream = topology.stream_nr(sap, beam, component, part);
                        assert!(seen.insert(stream), "stream {stream} duplicated");
                        assert!(stream < obs.nr_beam_streams());
                        assert_eq!(
                            topology.decompose_stream_nr(stream),
                            StreamParts {
                                sap,
                                beam,
                                component,
                                part
                            }
                        );
                    }
                }
            }
        }
        assert_eq!(seen.len(), obs.nr_beam_streams());
    }

    #[test]
    fn ring_matches_owner_functions() {
        let obs = small_observation();
        let topology = Topology::new(&obs);
        // Rank 2 is (pset 0, core 2): phase two core slot 2.
        let core_slot = topology.phase_two_core_slot(2).unwrap();
        let mut ring = Ring::subbands(&topology, core_slot);
        for block in 0..8 {
            let owned: Vec<usize> = ring.owned();
            assert_eq!(
                owned,
                topology.owned_subbands(2, block),
                "block {block}"
            );
            ring.advance();
        }
    }

    #[test]
    fn roles_cover_all_phases() {
        let obs = small_observation();
        let topology = Topology::new(&obs);
        // 4 stations over pset 0's four cores: one station each.
        let mut stations_seen = Vec::new();
        for rank in 0..topology.nr_ranks() {
            let roles = topology.roles(rank);
            stations_seen.extend(roles.stations.iter().copied());
            let locus = topology.locus_of(rank);
            assert_eq!(roles.phase_two, locus.pset == 0);
            assert_eq!(roles.phase_three, locus.pset == 1);
        }
        stations_seen.sort_unstable();
        assert_eq!(stations_seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn idle_rank_has_no_roles() {
        let mut obs = small_observation();
        obs.phase_three = Some(PhasePartition {
            psets: vec1![1],
            cores: vec1![0, 1],
        });
        let topology = Topology::new(&obs);
        // (pset 1, core 3) is in no phase.
        let rank = topology.rank_of(Locus { pset: 1, core: 3 });
        assert!(topology.roles(rank).is_idle());
    }
}
