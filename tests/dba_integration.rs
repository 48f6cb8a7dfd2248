// End-to-end runs over small synthetic sequence sets, checking the
// produced files and in-memory outcomes together.

use std::fs;

use dtw_barycenter::utilities::progress::NullProgress;
use dtw_barycenter::{
    perform_dba, run, AlgoMode, DbaConfig, DbaResult, DevicePoolConfig, Sequence, SequenceData,
};

fn config(prefix: &str) -> DbaConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    DbaConfig {
        output_prefix: prefix.to_string(),
        device_pool: DevicePoolConfig {
            devices: 1,
            threads_per_device: Some(2),
            max_swath_width: 8,
            memory_budget_bytes: 1 << 24,
        },
        ..DbaConfig::default()
    }
}

fn prefix_in(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn identical_inputs_produce_zero_distances_one_cluster_and_the_input_consensus() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "ident");
    let cfg = config(&prefix);
    let seqs = vec![
        Sequence::new("a", vec![1.0f64, 2.0, 3.0]),
        Sequence::new("b", vec![1.0, 2.0, 3.0]),
        Sequence::new("c", vec![1.0, 2.0, 3.0]),
    ];
    let outcome = perform_dba(seqs, &cfg, &mut NullProgress).expect("run");

    assert_eq!(outcome.memberships, vec![0, 0, 0]);
    assert_eq!(outcome.medoid_indices.len(), 1);
    assert_eq!(outcome.averages.len(), 1);
    assert_eq!(outcome.averages[0].1, vec![1.0, 2.0, 3.0]);

    let dists = fs::read_to_string(format!("{prefix}.pair_dists.txt")).expect("pair dists");
    let lines: Vec<&str> = dists.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "a\t0\t0\t0");

    let avg = fs::read_to_string(format!("{prefix}.avg.txt")).expect("avg");
    assert_eq!(avg, "a\t1\t2\t3\n");

    // Converged clusters leave no evolving-centroid checkpoint behind.
    assert!(!dir.path().join("ident.0.evolving_centroid.txt").exists());
}

#[test]
fn height_cut_splits_constant_groups_and_averages_each() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "groups");
    let mut cfg = config(&prefix);
    cfg.cdist = 0.5;
    let seqs = vec![
        Sequence::new("a", vec![1.0f64, 1.0, 1.0, 1.0]),
        Sequence::new("b", vec![1.0, 1.0, 1.0, 1.0]),
        Sequence::new("c", vec![5.0, 5.0, 5.0, 5.0]),
    ];
    let outcome = perform_dba(seqs, &cfg, &mut NullProgress).expect("run");

    assert_eq!(outcome.memberships, vec![0, 0, 1], "two clusters expected");
    assert_eq!(outcome.averages.len(), 2);
    assert_eq!(outcome.averages[0].1, vec![1.0, 1.0, 1.0, 1.0]);
    assert_eq!(outcome.averages[1].1, vec![5.0, 5.0, 5.0, 5.0]);

    let membership =
        fs::read_to_string(format!("{prefix}.cluster_membership.txt")).expect("membership");
    assert!(membership.starts_with("## cluster distance threshold was 0.5"));
    assert!(membership.contains("c\t1\tc"), "singleton is its own medoid");
}

#[test]
fn two_member_open_end_consensus_anchors_on_the_longer_medoid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "open");
    let mut cfg = config(&prefix);
    cfg.open_end = true;
    let seqs = vec![
        Sequence::new("short", vec![0.0f64, 1.0, 2.0, 3.0, 4.0]),
        Sequence::new("long", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    ];
    let outcome = perform_dba(seqs, &cfg, &mut NullProgress).expect("run");

    // N=2: the longer sequence is the medoid and anchors the consensus
    // length; the short member's alignment skips the free tail.
    assert_eq!(outcome.medoid_indices, vec![1]);
    assert_eq!(outcome.averages[0].0, "long");
    assert_eq!(
        outcome.averages[0].1,
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn cluster_only_then_consensus_only_round_trips_the_membership() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "modes");
    let seqs = || {
        vec![
            Sequence::new("a", vec![1.0f64, 1.0, 1.0, 1.0]),
            Sequence::new("b", vec![1.0, 1.0, 1.0, 1.0]),
            Sequence::new("c", vec![5.0, 5.0, 5.0, 5.0]),
        ]
    };

    let mut cluster_cfg = config(&prefix);
    cluster_cfg.cdist = 0.5;
    cluster_cfg.algo_mode = AlgoMode::ClusterOnly;
    let first = perform_dba(seqs(), &cluster_cfg, &mut NullProgress).expect("cluster only");
    assert!(first.averages.is_empty(), "cluster-only writes no averages");
    assert!(!dir.path().join("modes.avg.txt").exists());

    let mut consensus_cfg = config(&prefix);
    consensus_cfg.cdist = 0.5;
    consensus_cfg.algo_mode = AlgoMode::ConsensusOnly;
    let second = perform_dba(seqs(), &consensus_cfg, &mut NullProgress).expect("consensus only");
    assert_eq!(second.memberships, first.memberships);
    assert_eq!(second.medoid_indices, first.medoid_indices);
    assert_eq!(second.averages.len(), 2);
}

#[test]
fn single_input_passes_through_unrefined() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "solo");
    let cfg = config(&prefix);
    let outcome = perform_dba(
        vec![Sequence::new("only", vec![2.0f64, 4.0, 6.0])],
        &cfg,
        &mut NullProgress,
    )
    .expect("run");
    assert_eq!(outcome.memberships, vec![0]);
    assert_eq!(outcome.averages, vec![("only".to_string(), vec![2.0, 4.0, 6.0])]);
    let avg = fs::read_to_string(format!("{prefix}.avg.txt")).expect("avg");
    assert_eq!(avg, "only\t2\t4\t6\n");
}

#[test]
fn avg_checkpoint_resumes_at_the_first_missing_cluster() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "resume");
    let mut cfg = config(&prefix);
    cfg.cdist = 0.5;

    // A previous run already converged cluster 0.
    fs::write(format!("{prefix}.avg.txt"), "b\t9\t9\t9\t9\n").expect("seed avg");

    let seqs = vec![
        Sequence::new("a", vec![1.0f64, 1.0, 1.0, 1.0]),
        Sequence::new("b", vec![1.0, 1.0, 1.0, 1.0]),
        Sequence::new("c", vec![5.0, 5.0, 5.0, 5.0]),
    ];
    let outcome = perform_dba(seqs, &cfg, &mut NullProgress).expect("run");

    // Only the remaining cluster is converged in this run; the seeded row
    // survives untouched ahead of the new one.
    assert_eq!(outcome.averages.len(), 1);
    assert_eq!(outcome.averages[0].0, "c");
    let avg = fs::read_to_string(format!("{prefix}.avg.txt")).expect("avg");
    let lines: Vec<&str> = avg.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "b\t9\t9\t9\t9");
    assert!(lines[1].starts_with("c\t"));
}

#[test]
fn normalized_runs_rescale_back_to_the_medoid_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "norm");
    let mut cfg = config(&prefix);
    cfg.norm_sequences = true;
    let seqs = vec![
        Sequence::new("a", vec![10.0f64, 12.0, 14.0]),
        Sequence::new("b", vec![10.0, 12.0, 14.0]),
    ];
    let outcome = perform_dba(seqs, &cfg, &mut NullProgress).expect("run");
    for (t, v) in outcome.averages[0].1.iter().enumerate() {
        let expected = [10.0, 12.0, 14.0][t];
        assert!(
            (v - expected).abs() < 1e-9,
            "position {t}: {v} vs {expected}"
        );
    }
}

#[test]
fn permuting_the_input_order_keeps_cluster_contents() {
    let build = |order: &[usize]| {
        let base = [
            ("a", vec![1.0f64, 1.0, 1.0, 1.0]),
            ("b", vec![1.1, 1.0, 1.0, 1.0]),
            ("c", vec![5.0, 5.0, 5.0, 5.0]),
            ("d", vec![5.2, 5.0, 5.0, 5.0]),
        ];
        order
            .iter()
            .map(|&i| Sequence::new(base[i].0, base[i].1.clone()))
            .collect::<Vec<_>>()
    };
    fn cluster_sets<'a>(names: &'a [String], memberships: &[usize]) -> Vec<Vec<&'a str>> {
        let clusters = memberships.iter().copied().max().unwrap_or(0) + 1;
        let mut sets: Vec<Vec<&str>> = vec![Vec::new(); clusters];
        for (name, &m) in names.iter().zip(memberships) {
            sets[m].push(name.as_str());
        }
        for set in &mut sets {
            set.sort_unstable();
        }
        sets.sort();
        sets
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg_a = config(&prefix_in(&dir, "perm_a"));
    cfg_a.cdist = 0.5;
    cfg_a.algo_mode = AlgoMode::ClusterOnly;
    let mut cfg_b = config(&prefix_in(&dir, "perm_b"));
    cfg_b.cdist = 0.5;
    cfg_b.algo_mode = AlgoMode::ClusterOnly;

    let one = perform_dba(build(&[0, 1, 2, 3]), &cfg_a, &mut NullProgress).expect("run a");
    let two = perform_dba(build(&[3, 1, 0, 2]), &cfg_b, &mut NullProgress).expect("run b");
    assert_eq!(
        cluster_sets(&one.sequence_names, &one.memberships),
        cluster_sets(&two.sequence_names, &two.memberships),
        "cluster contents must be permutation-invariant"
    );
}

#[test]
fn dtype_dispatch_converts_to_the_configured_precision() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "dtype");
    let mut cfg = config(&prefix);
    cfg.dtype = dtw_barycenter::Dtype::F32;
    // f64 input against an f32 config converts instead of failing.
    let data = SequenceData::F64(vec![
        Sequence::new("a", vec![1.0, 2.0, 3.0]),
        Sequence::new("b", vec![1.0, 2.0, 3.0]),
    ]);
    match run(data, &cfg, &mut NullProgress).expect("run") {
        DbaResult::F32(outcome) => {
            assert_eq!(outcome.averages[0].1, vec![1.0f32, 2.0, 3.0]);
        }
        DbaResult::F64(_) => panic!("f32 config must produce an f32 outcome"),
    }
}

#[test]
fn path_files_are_written_per_member_with_name_headers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let prefix = prefix_in(&dir, "paths");
    let cfg = config(&prefix);
    let seqs = vec![
        Sequence::new("a", vec![0.0f64, 1.0, 2.0]),
        Sequence::new("b", vec![0.0, 1.0, 2.0, 3.0]),
    ];
    perform_dba(seqs, &cfg, &mut NullProgress).expect("run");

    let p0 = fs::read_to_string(format!("{prefix}.0.path0.txt")).expect("path0");
    assert_eq!(p0.lines().next(), Some("a"));
    let p1 = fs::read_to_string(format!("{prefix}.0.path1.txt")).expect("path1");
    assert_eq!(p1.lines().next(), Some("b"));
    // Step lines carry five tab-separated fields ending in a step name.
    let line = p0.lines().nth(1).expect("at least one step");
    let fields: Vec<&str> = line.split('\t').collect();
    assert_eq!(fields.len(), 5);
    assert!(["DIAG", "RIGHT", "UP", "OPEN_RIGHT"].contains(fields.last().unwrap()));
}
