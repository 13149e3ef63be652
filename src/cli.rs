// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code.
//!
//! Only two things should be public here: [`Cnproc`] and [`Cnproc::run`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::context::Observation;
use crate::error::CnprocError;
use crate::pipeline::run_observation;
use crate::plan::{ProcessingPlan, ALL_PRODUCTS};
use crate::topology::Topology;

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "Real-time correlator and beamformer pipeline for a LOFAR-style radio-telescope array"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
pub struct Cnproc {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    /// Run an observation described by a parset, with every rank of the
    /// partition as a thread in this process.
    Run(RunArgs),

    /// Verify a parset and print the processing plan and work
    /// distribution without processing anything.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to the observation parset (TOML).
    #[clap(name = "PARSET", parse(from_os_str))]
    parset: PathBuf,

    /// Override the parset's number of blocks.
    #[clap(long)]
    nr_blocks: Option<usize>,

    /// Override the parset's output directory.
    #[clap(long, parse(from_os_str))]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Path to the observation parset (TOML).
    #[clap(name = "PARSET", parse(from_os_str))]
    parset: PathBuf,

    /// How many blocks of ownership to preview.
    #[clap(long, default_value = "4")]
    nr_blocks: usize,
}

impl Cnproc {
    pub fn run() -> Result<(), CnprocError> {
        let args = Self::parse();
        setup_logging(args.global_opts.verbosity);
        match args.command {
            Command::Run(run) => {
                let mut obs = Observation::load(&run.parset)?;
                if let Some(nr_blocks) = run.nr_blocks {
                    obs.nr_blocks = nr_blocks;
                }
                if let Some(dir) = run.output_dir {
                    obs.output_dir = dir;
                }
                info!(
                    "observation '{}': {} stations, {} subbands, {} blocks",
                    obs.name,
                    obs.nr_stations(),
                    obs.nr_subbands(),
                    obs.nr_blocks
                );
                run_observation(&Arc::new(obs))?;
                Ok(())
            }
            Command::Plan(plan_args) => print_plan(&plan_args),
        }
    }
}

fn print_plan(args: &PlanArgs) -> Result<(), CnprocError> {
    let obs = Observation::load(&args.parset)?;
    let plan = ProcessingPlan::new(&obs)?;
    let topology = Topology::new(&obs);

    println!("observation '{}'", obs.name);
    println!(
        "  {} stations ({} after merging), {} subbands, {} channels, {} samples/block",
        obs.nr_stations(),
        obs.nr_merged_stations(),
        obs.nr_subbands(),
        obs.nr_channels_per_subband,
        obs.nr_samples_per_channel(),
    );
    println!("  phase-three mode: {:?}", obs.phase_three_mode());
    println!();
    println!("plan (product kinds: {}):", *ALL_PRODUCTS);
    for item in plan.items() {
        println!(
            "  {:18} calculate={:5} transpose={:5} output={:5} arena={:?} {:>12} B",
            item.kind.to_string(),
            item.calculate,
            item.transpose,
            item.output,
            item.arena,
            item.bytes,
        );
    }

    println!();
    println!("subband ownership:");
    for block in 0..args.nr_blocks {
        let owners: Vec<String> = (0..obs.nr_subbands())
            .map(|sb| {
                let locus = topology.subband_owner(sb, block).expect("subband in range");
                format!("{sb}->({},{})", locus.pset, locus.core)
            })
            .collect();
        println!("  block {block}: {}", owners.join(" "));
    }

    if obs.nr_beam_streams() > 0 {
        println!();
        println!("beam stream ownership:");
        for block in 0..args.nr_blocks {
            let owners: Vec<String> = (0..obs.nr_beam_streams())
                .map(|st| {
                    let locus = topology.beam_owner(st, block).expect("stream in range");
                    format!("{st}->({},{})", locus.pset, locus.core)
                })
                .collect();
            println!("  block {block}: {}", owners.join(" "));
        }
    }
    Ok(())
}

/// Activate a logger. All log messages are put onto `stdout`.
/// `env_logger` automatically switches off colours for non-terminals.
fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        _ => builder.filter_level(log::LevelFilter::Trace),
    };
    builder.init();
}
