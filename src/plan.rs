// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The processing plan.

Built once per observation from the parset, the plan records for every
data-set kind whether it is calculated this run, whether it crosses the
second transpose, whether (and where) it is written out, and which arena its
buffer lives in. Block processing never consults anything else to decide
what to do, and never mutates the plan, which is what keeps every rank's
control flow consistent without runtime negotiation.
 */

use indexmap::IndexMap;
use itertools::Itertools;
use log::info;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::context::{DedispersionWhere, Observation, Phase3Mode};

lazy_static::lazy_static! {
    /// All data-set kinds, comma-separated; handy for help text.
    pub static ref ALL_PRODUCTS: String = ProductKind::iter().join(", ");
}

/// Every data-set kind the pipeline can produce. The same enum identifies
/// output products and their record streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
pub enum ProductKind {
    /// Channelized per-station samples.
    #[strum(serialize = "filtered")]
    Filtered,

    /// Visibilities for all baselines of one subband.
    #[strum(serialize = "correlated")]
    Correlated,

    /// Stokes powers summed over stations, per subband.
    #[strum(serialize = "incoherent-stokes")]
    IncoherentStokes,

    /// Complex beam voltages (the pre-transpose coherent product).
    #[strum(serialize = "beam-formed")]
    BeamFormed,

    /// Stokes powers of the formed beams.
    #[strum(serialize = "coherent-stokes")]
    CoherentStokes,

    /// Per-beam pulse detections, computed after reassembly.
    #[strum(serialize = "trigger")]
    Trigger,
}

impl ProductKind {
    /// Is this product emitted per subband (phase two) rather than per beam
    /// stream (phase three)?
    pub fn per_subband(self) -> bool {
        matches!(
            self,
            ProductKind::Filtered | ProductKind::Correlated | ProductKind::IncoherentStokes
        )
    }
}

/// One row of the plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanItem {
    pub kind: ProductKind,

    /// Computed this run at all.
    pub calculate: bool,

    /// Crosses the beam transpose to phase three.
    pub transpose: bool,

    /// Written to output streams.
    pub output: bool,

    /// Which arena the data set's buffer is allocated from, when
    /// calculated.
    pub arena: Option<usize>,

    /// Buffer bytes needed per rank.
    pub bytes: usize,
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("No output products are enabled; the observation would compute nothing")]
    NothingToDo,

    #[error("Output product '{0}' needs phase-three psets, but none are configured")]
    NoPhaseThree(ProductKind),

    #[error("Dedispersion after beamforming is enabled, but no beams are formed")]
    DedisperseAfterWithoutBeams,

    #[error(
        "Pre-correlation flagger integration ({integration}) must divide cn_integration_steps ({steps})"
    )]
    FlaggerIntegrationDoesntDivide { integration: usize, steps: usize },
}

#[derive(Debug, Clone)]
pub struct ProcessingPlan {
    items: IndexMap<ProductKind, PlanItem>,
}

impl ProcessingPlan {
    /// Derive the plan from an observation. Fails on configurations that
    /// enable a product with no path to compute it; such inconsistencies
    /// abort before any block is processed.
    pub fn new(obs: &Observation) -> Result<ProcessingPlan, PlanError> {
        let out = &obs.outputs;
        if !(out.filtered
            || out.correlated
            || out.incoherent_stokes
            || out.beam_formed
            || out.coherent_stokes
            || out.trigger)
        {
            return Err(PlanError::NothingToDo);
        }

        let needs_phase3 = out.beam_formed || out.coherent_stokes || out.trigger;
        if needs_phase3 && obs.phase_three_mode() == Phase3Mode::None {
            let product = if out.beam_formed {
                ProductKind::BeamFormed
            } else if out.coherent_stokes {
                ProductKind::CoherentStokes
            } else {
                ProductKind::Trigger
            };
            return Err(PlanError::NoPhaseThree(product));
        }

        let beams_formed = out.beam_formed || out.coherent_stokes || out.trigger;
        if let Some(dd) = &obs.dedispersion {
            if dd.when == DedispersionWhere::AfterBeamforming && !beams_formed {
                return Err(PlanError::DedisperseAfterWithoutBeams);
            }
        }
        if let Some(pre) = &obs.pre_flagger {
            if pre.integration == 0 || obs.cn_integration_steps % pre.integration != 0 {
                return Err(PlanError::FlaggerIntegrationDoesntDivide {
                    integration: pre.integration,
                    steps: obs.cn_integration_steps,
                });
            }
        }

        let nr_channels = obs.nr_channels_per_subband;
        let steps = obs.cn_integration_steps;
        let c32_size = std::mem::size_of::<crate::c32>();

        let filtered_bytes = obs.nr_stations() * nr_channels * steps * 2 * c32_size;
        let correlated_bytes = obs.nr_baselines() * nr_channels * 4 * c32_size
            + obs.nr_baselines() * nr_channels * std::mem::size_of::<u32>();
        let incoherent_bytes = obs.incoherent_stokes.kind.nr_components()
            * nr_channels
            * (steps / obs.incoherent_stokes.time_integration)
            * std::mem::size_of::<f32>();
        let beam_formed_bytes = obs.nr_pencils() * nr_channels * steps * 2 * c32_size;
        let coherent_bytes = obs.nr_pencils()
            * obs.coherent_stokes.kind.nr_components()
            * nr_channels
            * (steps / obs.coherent_stokes.time_integration)
            * std::mem::size_of::<f32>();

        let mut rows = vec![
            PlanItem {
                kind: ProductKind::Filtered,
                calculate: true,
                transpose: false,
                output: out.filtered,
                arena: None,
                bytes: filtered_bytes,
            },
            PlanItem {
                kind: ProductKind::Correlated,
                calculate: out.correlated,
                transpose: false,
                output: out.correlated,
                arena: None,
                bytes: correlated_bytes,
            },
            PlanItem {
                kind: ProductKind::IncoherentStokes,
                calculate: out.incoherent_stokes,
                transpose: false,
                output: out.incoherent_stokes,
                arena: None,
                bytes: incoherent_bytes,
            },
            PlanItem {
                kind: ProductKind::BeamFormed,
                calculate: beams_formed,
                transpose: out.beam_formed,
                output: out.beam_formed,
                arena: None,
                bytes: beam_formed_bytes,
            },
            PlanItem {
                kind: ProductKind::CoherentStokes,
                calculate: out.coherent_stokes || out.trigger,
                transpose: out.coherent_stokes || out.trigger,
                output: out.coherent_stokes,
                arena: None,
                bytes: coherent_bytes,
            },
            PlanItem {
                kind: ProductKind::Trigger,
                calculate: out.trigger,
                transpose: false,
                output: out.trigger,
                arena: None,
                bytes: 64,
            },
        ];

        // Assign arenas to everything that is calculated.
        let mut next_arena = 0;
        for row in rows.iter_mut() {
            if row.calculate {
                row.arena = Some(next_arena);
                next_arena += 1;
            }
        }

        Ok(ProcessingPlan {
            items: rows.into_iter().map(|r| (r.kind, r)).collect(),
        })
    }

    pub fn item(&self, kind: ProductKind) -> &PlanItem {
        &self.items[&kind]
    }

    pub fn calculate(&self, kind: ProductKind) -> bool {
        self.items[&kind].calculate
    }

    pub fn transpose(&self, kind: ProductKind) -> bool {
        self.items[&kind].transpose
    }

    pub fn output(&self, kind: ProductKind) -> bool {
        self.items[&kind].output
    }

    pub fn items(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.values()
    }

    pub fn nr_arenas(&self) -> usize {
        self.items
            .values()
            .filter_map(|i| i.arena)
            .max()
            .map(|a| a + 1)
            .unwrap_or(0)
    }

    /// The kind whose data actually crosses the beam transpose: complex
    /// voltages or coherent Stokes, never both.
    pub fn transposed_kind(&self) -> Option<ProductKind> {
        self.items.values().find(|i| i.transpose).map(|i| i.kind)
    }

    /// How many output streams a product fans out over.
    pub fn nr_output_streams(&self, kind: ProductKind, obs: &Observation) -> usize {
        if !self.output(kind) {
            return 0;
        }
        if kind.per_subband() {
            obs.nr_subbands()
        } else {
            obs.nr_beam_streams()
        }
    }

    pub fn log_summary(&self) {
        info!("Processing plan:");
        for item in self.items.values() {
            if !item.calculate {
                continue;
            }
            info!(
                "  {:18} arena {}  {:>12} B{}{}",
                item.kind.to_string(),
                item.arena.unwrap(),
                item.bytes,
                if item.transpose { "  transposed" } else { "" },
                if item.output { "  output" } else { "" },
            );
        }
    }
}
