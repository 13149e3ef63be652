// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use indoc::indoc;
use vec1::vec1;

use super::*;

/// A small but complete observation used throughout the crate's tests:
/// 4 stations, 2 subbands, 4 channels, correlated + coherent Stokes I out,
/// phase 3 on its own pset.
pub(crate) fn small_observation() -> Observation {
    Observation {
        name: "test obs".to_string(),
        start_time_gpst: 1_065_880_128.0,
        sample_rate: 195312.5,
        subbands: vec1![100, 101],
        subband_width: 195312.5,
        nr_channels_per_subband: 4,
        nr_ppf_taps: 4,
        cn_integration_steps: 16,
        nr_blocks: 2,
        fake_input: true,
        output_dir: PathBuf::from("."),
        station: vec1![
            Station {
                name: "CS001".to_string(),
                position: [0.0, 0.0, 0.0],
            },
            Station {
                name: "CS002".to_string(),
                position: [100.0, 0.0, 0.0],
            },
            Station {
                name: "CS003".to_string(),
                position: [0.0, 150.0, 0.0],
            },
            Station {
                name: "RS106".to_string(),
                position: [5000.0, -2000.0, 10.0],
            },
        ],
        superstation: vec![],
        sap: vec![Sap {
            direction: [0.0, 0.0, 1.0],
            beam: vec![Beam {
                offset: [0.0, 0.0, 0.0],
            }],
        }],
        fly_s_eye: false,
        phase_one: PhasePartition {
            psets: vec1![0],
            cores: vec1![0, 1, 2, 3],
        },
        phase_two: PhasePartition {
            psets: vec1![0],
            cores: vec1![0, 1, 2, 3],
        },
        phase_three: Some(PhasePartition {
            psets: vec1![1],
            cores: vec1![0, 1, 2, 3],
        }),
        cores_per_pset: 4,
        coherent_stokes: StokesSettings {
            kind: StokesKind::I,
            time_integration: 1,
            subbands_per_part: None,
        },
        incoherent_stokes: StokesSettings::default(),
        dedispersion: None,
        pre_flagger: None,
        post_flagger: None,
        trigger: None,
        outputs: Outputs {
            correlated: true,
            coherent_stokes: true,
            ..Default::default()
        },
    }
}

#[test]
fn small_observation_is_valid() {
    small_observation().validate().unwrap();
}

#[test]
fn parse_minimal_parset() {
    let parset = indoc! {r#"
        name = "minimal"
        start_time_gpst = 1065880128.0
        subbands = [300]
        cn_integration_steps = 768
        nr_blocks = 10
        cores_per_pset = 4

        [[station]]
        name = "CS001"
        position = [0.0, 0.0, 0.0]

        [phase_one]
        psets = [0]
        cores = [0]

        [phase_two]
        psets = [0]
        cores = [0, 1, 2, 3]

        [outputs]
        correlated = true
    "#};
    let obs: Observation = toml::from_str(parset).unwrap();
    obs.validate().unwrap();
    assert_eq!(obs.nr_stations(), 1);
    assert_eq!(obs.nr_channels_per_subband, 16);
    assert_eq!(obs.nr_ppf_taps, 16);
    assert_eq!(obs.nr_baselines(), 1);
    assert_eq!(obs.phase_three_mode(), Phase3Mode::None);
}

#[test]
fn derived_counts() {
    let obs = small_observation();
    assert_eq!(obs.nr_stations(), 4);
    assert_eq!(obs.nr_merged_stations(), 4);
    assert_eq!(obs.nr_baselines(), 10);
    assert_eq!(obs.nr_pencils(), 1);
    assert_eq!(obs.nr_coherent_components(), 1);
    assert_eq!(obs.nr_parts(), 1);
    assert_eq!(obs.nr_beam_streams(), 1);
    // 16 channel samples + 3 of history, 4 channels.
    assert_eq!(obs.nr_samples_to_cn_proc(), (16 + 3) * 4);
    assert_eq!(obs.phase_three_mode(), Phase3Mode::Disjunct);
}

#[test]
fn one_channel_needs_no_history() {
    let mut obs = small_observation();
    obs.nr_channels_per_subband = 1;
    assert_eq!(obs.effective_ppf_taps(), 1);
    assert_eq!(obs.nr_samples_to_cn_proc(), obs.cn_integration_steps);
}

#[test]
fn superstations_merge_counts() {
    let mut obs = small_observation();
    obs.superstation = vec![Superstation {
        name: "TA1".to_string(),
        stations: vec1!["CS001".to_string(), "CS002".to_string()],
    }];
    obs.validate().unwrap();
    assert_eq!(obs.nr_merged_stations(), 3);
    assert_eq!(obs.nr_baselines(), 6);
    let merged = obs.merged_stations();
    assert_eq!(merged[0].name, "TA1");
    assert_eq!(merged[0].members, vec![0, 1]);
    assert_eq!(merged[1].members, vec![2]);
    assert_eq!(merged[2].members, vec![3]);
}

#[test]
fn superstation_member_must_exist() {
    let mut obs = small_observation();
    obs.superstation = vec![Superstation {
        name: "TA1".to_string(),
        stations: vec1!["CS999".to_string()],
    }];
    assert!(matches!(
        obs.validate(),
        Err(ContextError::UnknownSuperstationMember { .. })
    ));
}

#[test]
fn phase3_psets_must_be_disjoint_or_identical() {
    let mut obs = small_observation();
    // Overlapping but not identical.
    obs.phase_two.psets = vec1![0, 1];
    obs.phase_three = Some(PhasePartition {
        psets: vec1![1, 2],
        cores: vec1![0, 1, 2, 3],
    });
    assert!(matches!(
        obs.validate(),
        Err(ContextError::Phase3NeitherDisjunctNorShared)
    ));
}

#[test]
fn shared_phase3_uses_phase2_cores() {
    let mut obs = small_observation();
    obs.phase_three = Some(obs.phase_two.clone());
    obs.validate().unwrap();
    assert_eq!(obs.phase_three_mode(), Phase3Mode::Shared);

    obs.phase_three = Some(PhasePartition {
        psets: obs.phase_two.psets.clone(),
        cores: vec1![0, 1],
    });
    assert!(matches!(
        obs.validate(),
        Err(ContextError::Phase3SharedCoreMismatch)
    ));
}

#[test]
fn coherent_products_are_mutually_exclusive() {
    let mut obs = small_observation();
    obs.outputs.beam_formed = true;
    assert!(matches!(
        obs.validate(),
        Err(ContextError::BothCoherentProducts)
    ));
}

#[test]
fn stokes_integration_must_divide_block() {
    let mut obs = small_observation();
    obs.coherent_stokes.time_integration = 5;
    assert!(matches!(
        obs.validate(),
        Err(ContextError::IntegrationDoesntDivide { .. })
    ));
}

#[test]
fn parts_cover_all_subbands() {
    let mut obs = small_observation();
    obs.coherent_stokes.subbands_per_part = Some(1);
    assert_eq!(obs.nr_parts(), 2);
    assert_eq!(obs.part_subbands(0), 0..1);
    assert_eq!(obs.part_subbands(1), 1..2);
    assert_eq!(obs.nr_beam_streams(), 2);
}

#[test]
fn flys_eye_pencils_track_merged_stations() {
    let mut obs = small_observation();
    obs.fly_s_eye = true;
    assert_eq!(obs.nr_pencils(), 4);
    obs.superstation = vec![Superstation {
        name: "TA1".to_string(),
        stations: vec1!["CS001".to_string(), "CS002".to_string()],
    }];
    assert_eq!(obs.nr_pencils(), 3);
}
