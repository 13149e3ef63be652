// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use vec1::vec1;

use super::*;
use crate::context::tests::small_observation;
use crate::context::{Outputs, PhasePartition};
use crate::io::read_records;
use crate::plan::ProcessingPlan;

/// The reference scenario: 4 stations, 2 subbands, 1 beam, Stokes I, no
/// dedispersion or flagging. One correlated record per (subband, block),
/// one coherent-Stokes record per block, nothing else.
#[test]
fn end_to_end_correlation_and_coherent_stokes() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = small_observation();
    obs.output_dir = dir.path().to_path_buf();
    let obs = Arc::new(obs);

    run_observation(&obs).unwrap();

    for sb in 0..2 {
        let records = read_records(dir.path().join(format!("correlated.{sb:03}.raw"))).unwrap();
        assert_eq!(records.len(), obs.nr_blocks);
        for (block, record) in records.iter().enumerate() {
            assert_eq!(record.block, block);
            // 10 baselines * 4 channels * 4 pol products * 2 (re, im),
            // then 40 weights and 10 centroids.
            assert_eq!(record.words.len(), 320 + 40 + 10);
            // Auto-correlation XX of station 0 on channel 1 is a power:
            // real, positive. Word index: (baseline 0, channel 1, XX).re.
            assert!(record.words[8] > 0.0, "block {block}");
            // Weights: channel 0 zero, others full.
            let weights = &record.words[320..360];
            assert_eq!(weights[0], 0.0);
            assert_eq!(weights[1], obs.nr_samples_per_channel() as f32);
        }
    }

    let records = read_records(dir.path().join("coherent-stokes.000.raw")).unwrap();
    assert_eq!(records.len(), obs.nr_blocks);
    for (block, record) in records.iter().enumerate() {
        assert_eq!(record.block, block);
        // [subbands in part][channels][samples]
        assert_eq!(record.dims, vec![2, 4, 16]);
        assert!(record.words.iter().all(|&w| w >= 0.0));
        assert!(record.words.iter().any(|&w| w > 0.0));
    }

    // Timestamps advance by the block duration.
    let dt = records[1].timestamp_gpst - records[0].timestamp_gpst;
    let expected = obs.block_duration().to_seconds();
    assert!((dt - expected).abs() < 1e-6);

    // Disabled products produce no streams at all.
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(names.iter().all(|n| {
        n.starts_with("correlated.") || n.starts_with("coherent-stokes.")
    }));
    assert_eq!(names.len(), 3);
}

/// A single rank doing phase one and two by itself: everything is local
/// delivery, and data sets that the plan doesn't calculate stay untouched
/// across blocks.
fn single_rank_observation() -> crate::context::Observation {
    let mut obs = small_observation();
    obs.phase_one = PhasePartition {
        psets: vec1![0],
        cores: vec1![0],
    };
    obs.phase_two = PhasePartition {
        psets: vec1![0],
        cores: vec1![0],
    };
    obs.phase_three = None;
    obs.cores_per_pset = 1;
    obs.outputs = Outputs {
        correlated: true,
        ..Default::default()
    };
    obs
}

#[test]
fn unplanned_buffers_stay_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = single_rank_observation();
    obs.output_dir = dir.path().to_path_buf();
    let obs = Arc::new(obs);
    let topology = Arc::new(Topology::new(&obs));
    let plan = Arc::new(ProcessingPlan::new(&obs).unwrap());
    let registry = Arc::new(StreamRegistry::new(&obs.output_dir));
    for sb in 0..obs.nr_subbands() {
        registry.open(ProductKind::Correlated, sb).unwrap();
    }

    let mut endpoints = fabric(1, input_packet_words(&obs));
    let mut cn = CnProcessing::preprocess(
        obs.clone(),
        topology,
        plan,
        registry,
        0,
        Some(endpoints.pop().unwrap()),
        None,
    )
    .unwrap();

    for block in 0..obs.nr_blocks {
        cn.process(block).unwrap();
    }

    // Calculated data sets carry the last block's marker; beam and Stokes
    // data sets were never planned, so they were never even allocated.
    assert_eq!(cn.filtered.as_ref().unwrap().block, Some(obs.nr_blocks - 1));
    assert_eq!(cn.correlated.as_ref().unwrap().block, Some(obs.nr_blocks - 1));
    assert!(cn.beam_formed.is_none());
    assert!(cn.coherent.is_none());
    assert!(cn.incoherent.is_none());

    cn.postprocess().unwrap();
}

#[test]
fn missing_input_skips_output_but_not_the_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = single_rank_observation();
    obs.output_dir = dir.path().to_path_buf();
    obs.fake_input = false;
    obs.nr_blocks = 2;

    // Record files hold block 0 only; block 1 is a dropout.
    for station in 0..obs.nr_stations() {
        let path = obs
            .output_dir
            .join(format!("{}.input", obs.station[station].name));
        let mut samples =
            ndarray::Array3::zeros((obs.nr_subbands(), obs.nr_samples_to_cn_proc(), 2));
        for (i, v) in samples.iter_mut().enumerate() {
            *v = crate::c32::new(((i + station) % 11) as f32, 0.0);
        }
        let mut file = std::fs::File::create(path).unwrap();
        crate::io::read::write_station_record(&mut file, station, 0, &[], &samples).unwrap();
    }

    let obs = Arc::new(obs);
    run_observation(&obs).unwrap();

    for sb in 0..2 {
        let records = read_records(dir.path().join(format!("correlated.{sb:03}.raw"))).unwrap();
        let blocks: Vec<usize> = records.iter().map(|r| r.block).collect();
        assert_eq!(blocks, vec![0], "subband {sb}");
    }
}

#[test]
fn shared_phase3_runs_on_phase2_cores() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = small_observation();
    obs.output_dir = dir.path().to_path_buf();
    obs.phase_three = Some(obs.phase_two.clone());
    let obs = Arc::new(obs);

    run_observation(&obs).unwrap();

    let records = read_records(dir.path().join("coherent-stokes.000.raw")).unwrap();
    assert_eq!(records.len(), obs.nr_blocks);
}

#[test]
fn trigger_only_observation_emits_trigger_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = small_observation();
    obs.output_dir = dir.path().to_path_buf();
    obs.outputs = Outputs {
        trigger: true,
        ..Default::default()
    };
    obs.trigger = Some(crate::context::TriggerSettings { threshold: 2.0 });
    let obs = Arc::new(obs);

    run_observation(&obs).unwrap();

    let records = read_records(dir.path().join("trigger.000.raw")).unwrap();
    assert_eq!(records.len(), obs.nr_blocks);
    for record in &records {
        assert_eq!(record.dims, vec![4]);
        let mean = record.words[3];
        assert!(mean > 0.0);
    }
    // The coherent Stokes data fed the trigger but was not an output.
    assert!(!dir.path().join("coherent-stokes.000.raw").exists());
}

#[test]
fn flagged_pipeline_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut obs = small_observation();
    obs.output_dir = dir.path().to_path_buf();
    obs.pre_flagger = Some(crate::context::PreFlaggerSettings {
        detector: crate::context::DetectorKind::SumThreshold,
        integration: 4,
        sensitivity: 4.0,
    });
    obs.post_flagger = Some(crate::context::PostFlaggerSettings {
        sensitivity: 4.0,
        broken_station_ratio: Some(0.9),
    });
    let obs = Arc::new(obs);

    run_observation(&obs).unwrap();
    for sb in 0..2 {
        let records = read_records(dir.path().join(format!("correlated.{sb:03}.raw"))).unwrap();
        assert_eq!(records.len(), obs.nr_blocks);
    }
}
