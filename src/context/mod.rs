// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The observation parameter set.

An observation is described by a flat TOML parset, finalized before any rank
starts processing. Everything a rank needs to know — stations, subbands,
channelization, beams, phase partitions, product switches — is in here, and
all of it is read-only once loaded. Work distribution must be derivable from
this struct plus a block number alone; see [`crate::topology`].
 */

mod error;
#[cfg(test)]
pub(crate) mod tests;

pub use error::ContextError;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hifitime::{Duration, Epoch};
use serde::Deserialize;
use vec1::Vec1;

/// One physical station (or antenna field) of the array.
#[derive(Debug, Clone, Deserialize)]
pub struct Station {
    pub name: String,

    /// Geocentric position \[metres\]. Only relative positions matter for
    /// the geometric delays this pipeline applies.
    pub position: [f64; 3],
}

/// Several physical stations summed into one "tied-array" station before
/// beamforming and correlation.
#[derive(Debug, Clone, Deserialize)]
pub struct Superstation {
    pub name: String,

    /// Names of the member stations.
    pub stations: Vec1<String>,
}

/// A station appearing in the merged (post-superstation) station list:
/// either a superstation or an unmerged physical station.
#[derive(Debug, Clone)]
pub struct MergedStation {
    pub name: String,

    /// Indices into [`Observation::station`].
    pub members: Vec<usize>,
}

/// A sub-array pointing: one pointed direction with any number of pencil
/// beams offset from it.
#[derive(Debug, Clone, Deserialize)]
pub struct Sap {
    /// Unit pointing vector in the station coordinate frame.
    pub direction: [f64; 3],

    #[serde(default)]
    pub beam: Vec<Beam>,
}

/// A pencil beam within a SAP.
#[derive(Debug, Clone, Deserialize)]
pub struct Beam {
    /// Offset from the SAP direction; the summed vector is re-normalized.
    #[serde(default)]
    pub offset: [f64; 3],
}

/// A fully-resolved pencil beam: the unit of phase-three work, before the
/// Stokes/part fan-out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pencil {
    pub sap: usize,
    pub beam: usize,
    pub direction: [f64; 3],
}

/// The psets and within-pset cores a phase runs on.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PhasePartition {
    pub psets: Vec1<usize>,
    pub cores: Vec1<usize>,
}

/// Which Stokes products a coherent or incoherent calculator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display)]
pub enum StokesKind {
    /// Total intensity only.
    I,
    /// Full Stokes.
    IQUV,
    /// The two linear powers, no cross terms.
    XXYY,
}

impl StokesKind {
    pub fn nr_components(self) -> usize {
        match self {
            StokesKind::I => 1,
            StokesKind::IQUV => 4,
            StokesKind::XXYY => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StokesSettings {
    pub kind: StokesKind,

    /// How many channel samples are summed into one output sample.
    #[serde(default = "default_time_integration")]
    pub time_integration: usize,

    /// How many consecutive subbands form one beam "part" (the unit a single
    /// phase-three rank reassembles). Defaults to all subbands in one part.
    #[serde(default)]
    pub subbands_per_part: Option<usize>,
}

fn default_time_integration() -> usize {
    1
}

impl Default for StokesSettings {
    fn default() -> StokesSettings {
        StokesSettings {
            kind: StokesKind::I,
            time_integration: 1,
            subbands_per_part: None,
        }
    }
}

/// Where dedispersion happens relative to beamforming. Decided once per
/// observation, never per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedispersionWhere {
    /// On per-station filtered data. Needed when incoherent products must
    /// also see dedispersed samples.
    BeforeBeamforming,
    /// On per-beam data; cheaper when only coherent products are wanted.
    AfterBeamforming,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedispersionSettings {
    /// \[pc cm^-3\]
    pub dispersion_measure: f64,

    #[serde(rename = "where")]
    pub when: DedispersionWhere,
}

/// Which detection statistic the pre-correlation flagger runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    /// Flag windows whose power exceeds mean + sensitivity * stddev.
    #[strum(serialize = "threshold")]
    Threshold,
    /// The SumThreshold family: progressively longer runs of samples are
    /// flagged against progressively lower thresholds.
    #[strum(serialize = "sum-threshold")]
    SumThreshold,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreFlaggerSettings {
    pub detector: DetectorKind,

    /// Samples per detection window.
    #[serde(default = "default_flagger_integration")]
    pub integration: usize,

    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,
}

fn default_flagger_integration() -> usize {
    16
}

fn default_sensitivity() -> f32 {
    4.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostFlaggerSettings {
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,

    /// When the fraction of flagged visibilities touching one station
    /// exceeds this, the station is declared broken and all its baselines
    /// are flagged. `None` disables the pass.
    #[serde(default)]
    pub broken_station_ratio: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSettings {
    /// Detection threshold in units of the block's mean integrated power.
    #[serde(default = "default_trigger_threshold")]
    pub threshold: f32,
}

fn default_trigger_threshold() -> f32 {
    8.0
}

/// The output-product switches. Every enabled product gets its own numbered
/// output streams; a disabled product produces no records at all.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Outputs {
    pub filtered: bool,
    pub correlated: bool,
    pub incoherent_stokes: bool,
    pub beam_formed: bool,
    pub coherent_stokes: bool,
    pub trigger: bool,
}

/// Is phase three absent, on its own psets, or sharing phase two's cores?
///
/// The two non-absent variants use *different* beam-owner functions; see
/// [`crate::topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase3Mode {
    None,
    Disjunct,
    Shared,
}

/// The observation parameter set. See the module docs; every field is fixed
/// before `preprocess()` and never written afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Observation {
    pub name: String,

    /// Observation start \[GPST seconds\].
    pub start_time_gpst: f64,

    /// Raw sample rate per subband \[Hz\].
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// The subband numbers this observation records. Subband `s` is centred
    /// on `s * subband_width`.
    pub subbands: Vec1<usize>,

    #[serde(default = "default_sample_rate")]
    pub subband_width: f64,

    #[serde(default = "default_nr_channels")]
    pub nr_channels_per_subband: usize,

    #[serde(default = "default_ppf_taps")]
    pub nr_ppf_taps: usize,

    /// Channel samples per block: the real-time unit of work.
    pub cn_integration_steps: usize,

    /// Blocks in the observation.
    pub nr_blocks: usize,

    /// Substitute a deterministic synthetic signal for station input.
    #[serde(default)]
    pub fake_input: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    pub station: Vec1<Station>,

    #[serde(default)]
    pub superstation: Vec<Superstation>,

    #[serde(default)]
    pub sap: Vec<Sap>,

    /// Fly's-eye mode: every merged station becomes its own "beam", with no
    /// summation across stations.
    #[serde(default)]
    pub fly_s_eye: bool,

    pub phase_one: PhasePartition,
    pub phase_two: PhasePartition,
    #[serde(default)]
    pub phase_three: Option<PhasePartition>,

    /// Cores per pset in the partition; ranks are numbered
    /// `pset * cores_per_pset + core`.
    pub cores_per_pset: usize,

    #[serde(default)]
    pub coherent_stokes: StokesSettings,

    #[serde(default)]
    pub incoherent_stokes: StokesSettings,

    #[serde(default)]
    pub dedispersion: Option<DedispersionSettings>,

    #[serde(default)]
    pub pre_flagger: Option<PreFlaggerSettings>,

    #[serde(default)]
    pub post_flagger: Option<PostFlaggerSettings>,

    #[serde(default)]
    pub trigger: Option<TriggerSettings>,

    #[serde(default)]
    pub outputs: Outputs,
}

fn default_sample_rate() -> f64 {
    // 200 MHz clock, 1024-point station filter bank.
    195312.5
}

fn default_nr_channels() -> usize {
    16
}

fn default_ppf_taps() -> usize {
    crate::constants::DEFAULT_PPF_TAPS
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Observation {
    /// Read and validate a parset file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Observation, ContextError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ContextError::FileRead(path.to_path_buf(), e))?;
        let obs: Observation =
            toml::from_str(&contents).map_err(|e| ContextError::Parse(path.to_path_buf(), e))?;
        obs.validate()?;
        Ok(obs)
    }

    pub fn nr_stations(&self) -> usize {
        self.station.len()
    }

    pub fn nr_subbands(&self) -> usize {
        self.subbands.len()
    }

    /// Centre frequency of the subband at index `i` \[Hz\].
    pub fn subband_frequency(&self, i: usize) -> f64 {
        self.subbands[i] as f64 * self.subband_width
    }

    /// Centre frequency of one fine channel \[Hz\].
    pub fn channel_frequency(&self, subband: usize, channel: usize) -> f64 {
        let chan_width = self.channel_width();
        self.subband_frequency(subband) - self.subband_width / 2.0
            + (channel as f64 + 0.5) * chan_width
    }

    pub fn channel_width(&self) -> f64 {
        self.subband_width / self.nr_channels_per_subband as f64
    }

    pub fn nr_samples_per_channel(&self) -> usize {
        self.cn_integration_steps
    }

    /// A 1-channel observation bypasses the filter bank, so it needs no
    /// history padding either.
    pub fn effective_ppf_taps(&self) -> usize {
        if self.nr_channels_per_subband == 1 {
            1
        } else {
            self.nr_ppf_taps
        }
    }

    /// Raw samples a phase-two rank consumes per (station, subband, block).
    /// Includes the `taps - 1` channel samples of filter history that
    /// overlap the previous block.
    pub fn nr_samples_to_cn_proc(&self) -> usize {
        (self.cn_integration_steps + self.effective_ppf_taps() - 1) * self.nr_channels_per_subband
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_seconds(
            self.cn_integration_steps as f64 * self.nr_channels_per_subband as f64
                / self.sample_rate,
        )
    }

    pub fn start_epoch(&self) -> Epoch {
        Epoch::from_gpst_seconds(self.start_time_gpst)
    }

    pub fn block_epoch(&self, block: usize) -> Epoch {
        self.start_epoch() + self.block_duration() * block as f64
    }

    /// The merged (post-superstation) station list, ordered by each entry's
    /// lowest member index. That ordering lets the station merger sum
    /// members into merged slots in place: slot `m` only reads station
    /// indices `>= m`.
    pub fn merged_stations(&self) -> Vec<MergedStation> {
        let mut merged = Vec::new();
        let mut taken = HashSet::new();
        for ss in &self.superstation {
            let members: Vec<usize> = ss
                .stations
                .iter()
                .map(|name| self.station_index(name).expect("validated"))
                .collect();
            taken.extend(members.iter().copied());
            merged.push(MergedStation {
                name: ss.name.clone(),
                members,
            });
        }
        for (i, st) in self.station.iter().enumerate() {
            if !taken.contains(&i) {
                merged.push(MergedStation {
                    name: st.name.clone(),
                    members: vec![i],
                });
            }
        }
        merged.sort_by_key(|m| m.members.iter().copied().min().unwrap());
        merged
    }

    pub fn nr_merged_stations(&self) -> usize {
        let in_superstations: usize = self.superstation.iter().map(|s| s.stations.len()).sum();
        self.superstation.len() + self.nr_stations() - in_superstations
    }

    /// Baselines between merged stations, auto-correlations included.
    pub fn nr_baselines(&self) -> usize {
        let n = self.nr_merged_stations();
        n * (n + 1) / 2
    }

    pub fn station_index(&self, name: &str) -> Option<usize> {
        self.station.iter().position(|s| s.name == name)
    }

    /// All pencil beams, flattened across SAPs. In fly's-eye mode each
    /// merged station is a pencil; the directions are then unused.
    pub fn pencils(&self) -> Vec<Pencil> {
        if self.fly_s_eye {
            return (0..self.nr_merged_stations())
                .map(|i| Pencil {
                    sap: 0,
                    beam: i,
                    direction: [0.0, 0.0, 1.0],
                })
                .collect();
        }
        let mut pencils = Vec::new();
        for (s, sap) in self.sap.iter().enumerate() {
            for (b, beam) in sap.beam.iter().enumerate() {
                let sum = [
                    sap.direction[0] + beam.offset[0],
                    sap.direction[1] + beam.offset[1],
                    sap.direction[2] + beam.offset[2],
                ];
                let len = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
                pencils.push(Pencil {
                    sap: s,
                    beam: b,
                    direction: [sum[0] / len, sum[1] / len, sum[2] / len],
                });
            }
        }
        pencils
    }

    pub fn nr_pencils(&self) -> usize {
        if self.fly_s_eye {
            self.nr_merged_stations()
        } else {
            self.sap.iter().map(|s| s.beam.len()).sum()
        }
    }

    /// Flatten a (sap, beam) pair into a pencil index.
    pub fn pencil_index(&self, sap: usize, beam: usize) -> usize {
        self.sap[..sap].iter().map(|s| s.beam.len()).sum::<usize>() + beam
    }

    /// Components per beam stream of the transposed coherent product:
    /// Stokes components, or the two polarizations of complex voltages.
    pub fn nr_coherent_components(&self) -> usize {
        if self.outputs.coherent_stokes {
            self.coherent_stokes.kind.nr_components()
        } else if self.outputs.beam_formed {
            2
        } else {
            0
        }
    }

    pub fn subbands_per_part(&self) -> usize {
        self.coherent_stokes
            .subbands_per_part
            .unwrap_or_else(|| self.nr_subbands())
    }

    pub fn nr_parts(&self) -> usize {
        let spp = self.subbands_per_part();
        (self.nr_subbands() + spp - 1) / spp
    }

    /// Subband indices covered by one part.
    pub fn part_subbands(&self, part: usize) -> std::ops::Range<usize> {
        let spp = self.subbands_per_part();
        let first = part * spp;
        first..(first + spp).min(self.nr_subbands())
    }

    /// Total beam streams: pencils × components × parts. The flattened
    /// "beam" index space that phase three distributes over.
    pub fn nr_beam_streams(&self) -> usize {
        self.nr_pencils() * self.nr_coherent_components() * self.nr_parts()
    }

    pub fn phase_three_mode(&self) -> Phase3Mode {
        let p3 = match &self.phase_three {
            None => return Phase3Mode::None,
            Some(p3) => p3,
        };
        if !(self.outputs.coherent_stokes || self.outputs.beam_formed || self.outputs.trigger) {
            return Phase3Mode::None;
        }
        if p3.psets == self.phase_two.psets {
            Phase3Mode::Shared
        } else {
            Phase3Mode::Disjunct
        }
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if !self.nr_channels_per_subband.is_power_of_two() {
            return Err(ContextError::ChannelsNotPowerOfTwo(
                self.nr_channels_per_subband,
            ));
        }
        if self.cn_integration_steps == 0 {
            return Err(ContextError::ZeroIntegrationSteps);
        }
        if self.nr_ppf_taps == 0 {
            return Err(ContextError::ZeroPpfTaps);
        }

        // Superstation membership must map to known stations, at most once.
        let mut seen = HashSet::new();
        for ss in &self.superstation {
            for name in &ss.stations {
                if self.station_index(name).is_none() {
                    return Err(ContextError::UnknownSuperstationMember {
                        superstation: ss.name.clone(),
                        station: name.clone(),
                    });
                }
                if !seen.insert(name.clone()) {
                    return Err(ContextError::DuplicateSuperstationMember {
                        station: name.clone(),
                    });
                }
            }
        }

        for (nr, partition) in [
            (1, Some(&self.phase_one)),
            (2, Some(&self.phase_two)),
            (3, self.phase_three.as_ref()),
        ] {
            let partition = match partition {
                Some(p) => p,
                None => continue,
            };
            let mut pset_seen = HashSet::new();
            for &p in &partition.psets {
                if !pset_seen.insert(p) {
                    return Err(ContextError::DuplicatePset(nr, p));
                }
            }
            for &c in &partition.cores {
                if c >= self.cores_per_pset {
                    return Err(ContextError::CoreOutOfRange(nr, c, self.cores_per_pset));
                }
            }
        }

        if let Some(p3) = &self.phase_three {
            let p2_psets: HashSet<usize> = self.phase_two.psets.iter().copied().collect();
            let shared = p3.psets == self.phase_two.psets;
            let disjoint = p3.psets.iter().all(|p| !p2_psets.contains(p));
            if !shared && !disjoint {
                return Err(ContextError::Phase3NeitherDisjunctNorShared);
            }
            if shared && p3.cores != self.phase_two.cores {
                return Err(ContextError::Phase3SharedCoreMismatch);
            }
        }

        if self.outputs.coherent_stokes && self.outputs.beam_formed {
            return Err(ContextError::BothCoherentProducts);
        }

        if self.outputs.coherent_stokes
            && self.cn_integration_steps % self.coherent_stokes.time_integration != 0
        {
            return Err(ContextError::IntegrationDoesntDivide {
                product: "coherent_stokes",
                factor: self.coherent_stokes.time_integration,
                steps: self.cn_integration_steps,
            });
        }
        if self.outputs.incoherent_stokes
            && self.cn_integration_steps % self.incoherent_stokes.time_integration != 0
        {
            return Err(ContextError::IntegrationDoesntDivide {
                product: "incoherent_stokes",
                factor: self.incoherent_stokes.time_integration,
                steps: self.cn_integration_steps,
            });
        }
        if self.coherent_stokes.subbands_per_part == Some(0) {
            return Err(ContextError::ZeroSubbandsPerPart);
        }

        if (self.outputs.coherent_stokes || self.outputs.beam_formed)
            && !self.fly_s_eye
            && self.nr_pencils() == 0
        {
            return Err(ContextError::NoBeams);
        }

        if !self.fly_s_eye {
            for sap in &self.sap {
                for beam in &sap.beam {
                    let d = [
                        sap.direction[0] + beam.offset[0],
                        sap.direction[1] + beam.offset[1],
                        sap.direction[2] + beam.offset[2],
                    ];
                    if (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt() < 1e-9 {
                        return Err(ContextError::ZeroLengthDirection(d));
                    }
                }
            }
        }

        Ok(())
    }
}
