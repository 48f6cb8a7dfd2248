//! Run orchestration: sanitize and sort the inputs, cluster (or read the
//! clustering back), then converge one barycenter per cluster with
//! cluster-level resume through `{prefix}.avg.txt`.

use std::sync::Arc;

use crate::cluster::{
    cluster_count, cluster_memberships, normalize_distances, read_membership, select_medoids,
    write_membership,
};
use crate::config::{AlgoMode, DbaConfig, Dtype};
use crate::engine::chop;
use crate::engine::device::DevicePool;
use crate::engine::pairwise::{compute_pairwise, write_pair_dists};
use crate::engine::refine::RefineJob;
use crate::error::DbaError;
use crate::sample::Sample;
use crate::sequences::{
    rescale, sanitize_overflow_tails, sort_by_length, znormalize, znormalize_one, NormStats,
    Sequence,
};
use crate::utilities::checkpoint::{completed_average_rows, AveragesWriter};
use crate::utilities::progress::ProgressSink;

/// In-memory result of a run; all file side effects have already
/// happened.
#[derive(Debug, Clone)]
pub struct DbaOutcome<T: Sample> {
    /// Sequences in the order the run processed them (sorted ascending by
    /// length), after sanitization and optional normalization.
    pub sequence_names: Vec<String>,
    /// Dense cluster id per sequence, in processing order.
    pub memberships: Vec<usize>,
    /// Medoid sequence index per cluster.
    pub medoid_indices: Vec<usize>,
    /// `(medoid_name, consensus)` for every cluster converged in this
    /// run; clusters restored from a previous run's `avg.txt` checkpoint
    /// are not repeated here.
    pub averages: Vec<(String, Vec<T>)>,
}

/// Input sequences in the element type named by [`DbaConfig::dtype`].
#[derive(Debug, Clone)]
pub enum SequenceData {
    F32(Vec<Sequence<f32>>),
    F64(Vec<Sequence<f64>>),
}

/// Outcome of a dtype-dispatched [`run`].
#[derive(Debug, Clone)]
pub enum DbaResult {
    F32(DbaOutcome<f32>),
    F64(DbaOutcome<f64>),
}

/// Dispatch [`perform_dba`] according to the configured element type.
/// Inputs in the other precision are converted, matching the declared
/// `dtype` rather than rejecting the caller.
pub fn run(
    data: SequenceData,
    config: &DbaConfig,
    progress: &mut dyn ProgressSink,
) -> Result<DbaResult, DbaError> {
    match (config.dtype, data) {
        (Dtype::F32, SequenceData::F32(seqs)) => {
            perform_dba(seqs, config, progress).map(DbaResult::F32)
        }
        (Dtype::F64, SequenceData::F64(seqs)) => {
            perform_dba(seqs, config, progress).map(DbaResult::F64)
        }
        (Dtype::F32, SequenceData::F64(seqs)) => {
            let seqs = seqs
                .into_iter()
                .map(|s| Sequence::new(s.name, s.values.into_iter().map(|v| v as f32).collect()))
                .collect();
            perform_dba::<f32>(seqs, config, progress).map(DbaResult::F32)
        }
        (Dtype::F64, SequenceData::F32(seqs)) => {
            let seqs = seqs
                .into_iter()
                .map(|s| {
                    Sequence::new(s.name, s.values.into_iter().map(f64::from).collect())
                })
                .collect();
            perform_dba::<f64>(seqs, config, progress).map(DbaResult::F64)
        }
    }
}

/// Locate and trim a leader prefix from every input, in place. Runs
/// before [`perform_dba`] when a leader is configured; normalization (if
/// requested) is applied to both the prefix and the inputs first so the
/// match happens in normalized space.
pub fn chop_prefix_from_sequences<T: Sample>(
    prefix: &Sequence<T>,
    sequences: &mut Vec<Sequence<T>>,
    config: &DbaConfig,
    progress: &mut dyn ProgressSink,
) -> Result<(), DbaError> {
    let pool = DevicePool::new(&config.device_pool)?;
    if config.norm_sequences {
        let mut normalized_prefix = prefix.clone();
        znormalize_one(&mut normalized_prefix);
        znormalize(sequences);
        chop::chop_prefix(
            &normalized_prefix,
            sequences,
            &config.output_prefix,
            &pool,
            progress,
        )?;
    } else {
        chop::chop_prefix(prefix, sequences, &config.output_prefix, &pool, progress)?;
    }
    Ok(())
}

/// Full DBA pipeline per the configured algorithm mode.
pub fn perform_dba<T: Sample>(
    mut sequences: Vec<Sequence<T>>,
    config: &DbaConfig,
    progress: &mut dyn ProgressSink,
) -> Result<DbaOutcome<T>, DbaError> {
    sanitize_overflow_tails(&mut sequences);
    sort_by_length(&mut sequences);

    let norm_stats: Vec<NormStats> = if config.norm_sequences {
        znormalize(&mut sequences)
    } else {
        Vec::new()
    };

    let pool = DevicePool::new(&config.device_pool)?;
    let sequences = Arc::new(sequences);
    let n = sequences.len();

    let (memberships, medoid_indices) = match config.algo_mode {
        AlgoMode::ClusterOnly | AlgoMode::ClusterAndConsensus => {
            progress.begin(if config.cdist != 1.0 {
                "finding initial clusters and medoids"
            } else {
                "finding initial medoid"
            });
            let distances = compute_pairwise(
                &sequences,
                config.open_start,
                config.open_end,
                &pool,
                progress,
            )?;
            write_pair_dists(&config.output_prefix, &sequences, &distances)?;

            let condensed = normalize_distances(&distances);
            let memberships = cluster_memberships(condensed, n, config.cdist)?;
            let medoids = select_medoids(&distances, &memberships, &sequences)?;
            write_membership(
                &config.output_prefix,
                config.cdist,
                &sequences,
                &memberships,
                &medoids,
            )?;
            log::info!(
                "found {} clusters using complete linkage and cluster distance cutoff {}",
                cluster_count(&memberships),
                config.cdist
            );
            progress.end();
            (memberships, medoids)
        }
        AlgoMode::ConsensusOnly => {
            log::info!("reading previous clustering data");
            read_membership(&config.output_prefix, &sequences)?
        }
    };

    let mut outcome = DbaOutcome {
        sequence_names: sequences.iter().map(|s| s.name.clone()).collect(),
        memberships: memberships.clone(),
        medoid_indices: medoid_indices.clone(),
        averages: Vec::new(),
    };

    if config.algo_mode == AlgoMode::ClusterOnly {
        return Ok(outcome);
    }

    let num_clusters = cluster_count(&memberships);
    let start_cluster = completed_average_rows(&config.output_prefix)?;
    if start_cluster > 0 {
        log::info!(
            "restarting convergence with cluster {}/{num_clusters} based on checkpoint in \
             {}.avg.txt",
            start_cluster + 1,
            config.output_prefix
        );
    }
    let mut averages = AveragesWriter::open_append(&config.output_prefix)?;

    for cluster in start_cluster..num_clusters {
        let members: Vec<usize> = memberships
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| (c == cluster).then_some(i))
            .collect();
        let medoid_index = medoid_indices[cluster];
        let medoid_name = sequences[medoid_index].name.clone();

        if members.len() == 1 {
            log::info!(
                "outputting singleton sequence {medoid_name} as-is \
                 (cluster {}/{num_clusters})",
                cluster + 1
            );
            let values = restore_range(
                &sequences[medoid_index].values,
                norm_stats.get(medoid_index),
            );
            averages.write_row(&medoid_name, &values)?;
            outcome.averages.push((medoid_name, values));
            continue;
        }

        log::info!(
            "processing cluster {}/{num_clusters}, {} members, medoid {medoid_name} has \
             length {}",
            cluster + 1,
            members.len(),
            sequences[medoid_index].len()
        );
        let job = RefineJob {
            sequences: &sequences,
            member_indices: &members,
            medoid_index,
            output_prefix: config.output_prefix.clone(),
            cluster,
            open_start: config.open_start,
            open_end: config.open_end,
            max_rounds: DbaConfig::MAX_REFINEMENT_ROUNDS,
        };
        let refined = job.run(&pool, progress)?;
        let values = restore_range(&refined.centroid, norm_stats.get(medoid_index));
        averages.write_row(&medoid_name, &values)?;
        job.discard_checkpoint();
        outcome.averages.push((medoid_name, values));
    }

    Ok(outcome)
}

/// Rescale a (possibly normalized) sequence back to the range described
/// by `stats`; passthrough when normalization was off.
fn restore_range<T: Sample>(values: &[T], stats: Option<&NormStats>) -> Vec<T> {
    match stats {
        Some(&stats) => values.iter().map(|&v| rescale(v, stats)).collect(),
        None => values.to_vec(),
    }
}
