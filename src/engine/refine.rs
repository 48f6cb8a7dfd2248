//! Iterative barycenter refinement (DBA).
//!
//! One round aligns every cluster member against the current centroid
//! with path storage, backtracks each alignment, and piles member values
//! onto the centroid positions their paths pass through with a non-open
//! step. The new centroid is the per-position mean; the round delta is
//! the largest pointwise change. Members are distributed breadth-first
//! across devices and run concurrently inside each device's pool, so the
//! pile-up buffers are atomic.
//!
//! Per member the path storage mode is chosen against the device gauge at
//! allocation time: a full pitched step matrix when it fits, otherwise
//! the striped mode that stores only each swath's leading-edge cost
//! column during the forward pass and recomputes one swath at a time
//! during backtracking. Between stripes only the current backtrace row is
//! carried, so every stripe is recomputed only up to the height the path
//! has already reached.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use rayon::prelude::*;
use thiserror::Error;

use crate::engine::device::{DeviceError, DevicePool};
use crate::engine::kernel::{replay_swath, DtwProblem, MatrixSink, SwathStream};
use crate::engine::step::{PathMatrix, StepCode};
use crate::sample::Sample;
use crate::sequences::Sequence;
use crate::utilities::checkpoint::{
    delete_evolving_centroid, evolving_centroid_path, read_evolving_centroid,
    write_evolving_centroid,
};
use crate::utilities::output::{OutputError, PathFileWriter};
use crate::utilities::progress::ProgressSink;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error(transparent)]
    Path(#[from] OutputError),
    #[error("refine: Cannot allocate host striped step matrix ({rows}x{cols})")]
    HostStripedStepMatrix { rows: usize, cols: usize },
    #[error("refine: Backtrace left the step matrix at (i={i}, j={j}); path matrix is corrupt")]
    CorruptBacktrace { i: isize, j: isize },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result of refining one cluster.
#[derive(Debug, Clone)]
pub struct RefineOutcome<T: Sample> {
    pub centroid: Vec<T>,
    pub rounds: usize,
    /// Delta reached zero (or a flip-flop was cut short) before the round
    /// cap.
    pub converged: bool,
    /// Terminated by two-round flip-flop detection; the kept centroid is
    /// the round before the repeat.
    pub flip_flop: bool,
}

/// One cluster's refinement request.
pub struct RefineJob<'a, T: Sample> {
    pub sequences: &'a Arc<Vec<Sequence<T>>>,
    /// Indices of the cluster members within `sequences`.
    pub member_indices: &'a [usize],
    pub medoid_index: usize,
    /// `{output_prefix}.{cluster}` — qualifies the path files and the
    /// evolving-centroid checkpoint.
    pub output_prefix: String,
    pub cluster: usize,
    pub open_start: bool,
    pub open_end: bool,
    pub max_rounds: usize,
}

impl<T: Sample> RefineJob<'_, T> {
    fn cluster_prefix(&self) -> String {
        format!("{}.{}", self.output_prefix, self.cluster)
    }

    /// Run refinement rounds until the delta hits zero, a flip-flop is
    /// detected (open mode), or the round cap is reached. Running past
    /// the cap is not an error.
    pub fn run(
        &self,
        pool: &DevicePool,
        progress: &mut dyn ProgressSink,
    ) -> Result<RefineOutcome<T>, RefineError> {
        let medoid = &self.sequences[self.medoid_index];
        let center_len = medoid.len();
        let checkpoint = evolving_centroid_path(&self.output_prefix, self.cluster);

        let mut centroid = match read_evolving_centroid::<T>(&checkpoint, center_len) {
            Some(resumed) => {
                log::info!(
                    "cluster {}: resuming refinement from checkpoint {}",
                    self.cluster,
                    checkpoint.display()
                );
                resumed
            }
            None => medoid.values.clone(),
        };

        let open_mode = self.open_start || self.open_end;
        let mut checkpoint_enabled = true;
        let mut previous: Option<Vec<T>> = None;
        let mut two_previous: Option<Vec<T>> = None;
        let mut outcome = RefineOutcome {
            centroid: Vec::new(),
            rounds: 0,
            converged: false,
            flip_flop: false,
        };

        progress.begin("converging centroid");
        for round in 0..self.max_rounds {
            let new_centroid = self.round(&centroid, pool)?;
            outcome.rounds = round + 1;
            progress.update(round + 1, self.max_rounds);

            let delta = max_point_delta(&centroid, &new_centroid);
            log::info!(
                "cluster {} round {}: new delta is {delta}",
                self.cluster,
                round + 1
            );
            if delta == 0.0 {
                centroid = new_centroid;
                outcome.converged = true;
                break;
            }

            if open_mode {
                if let Some(two_back) = &two_previous {
                    if bitwise_equal(&new_centroid, two_back) {
                        log::info!(
                            "detected a flip-flop between two alternative converged centroids, \
                             keeping the first one calculated"
                        );
                        if let Some(kept) = previous.take() {
                            centroid = kept;
                        }
                        outcome.converged = true;
                        outcome.flip_flop = true;
                        break;
                    }
                }
                two_previous = previous.take();
                previous = Some(new_centroid.clone());
            }

            if checkpoint_enabled {
                if let Err(err) = write_evolving_centroid(&checkpoint, &new_centroid) {
                    log::warn!(
                        "cannot checkpoint evolving centroid to {}: {err}; \
                         checkpointing disabled for this cluster",
                        checkpoint.display()
                    );
                    checkpoint_enabled = false;
                }
            }
            centroid = new_centroid;
        }
        progress.end();

        outcome.centroid = centroid;
        Ok(outcome)
    }

    /// Remove the evolving-centroid checkpoint once the converged average
    /// has been durably recorded.
    pub fn discard_checkpoint(&self) {
        delete_evolving_centroid(&evolving_centroid_path(&self.output_prefix, self.cluster));
    }

    /// One refinement round: align every member, pile up, and return the
    /// per-position mean.
    fn round(&self, centroid: &[T], pool: &DevicePool) -> Result<Vec<T>, RefineError> {
        let center_len = centroid.len();
        let sums = T::zeroed_cells(center_len);
        let counts: Vec<AtomicU32> = (0..center_len).map(|_| AtomicU32::new(0)).collect();
        let cluster_prefix = self.cluster_prefix();
        let width = pool.common_swath_width();

        thread::scope(|scope| -> Result<(), RefineError> {
            let mut handles = Vec::with_capacity(pool.len());
            for d in 0..pool.len() {
                let members: Vec<(usize, usize)> = self
                    .member_indices
                    .iter()
                    .copied()
                    .enumerate()
                    .filter(|(local, _)| local % pool.len() == d)
                    .collect();
                if members.is_empty() {
                    continue;
                }
                let sums = &sums;
                let counts = &counts;
                let cluster_prefix = cluster_prefix.as_str();
                let job = &*self;
                handles.push(scope.spawn(move || -> Result<(), RefineError> {
                    let device = pool.device(d);
                    device.pool().install(|| {
                        members.into_par_iter().try_for_each(|(local, seq_idx)| {
                            align_member(AlignMember {
                                device,
                                member: &job.sequences[seq_idx],
                                member_local_index: local,
                                centroid,
                                open_start: job.open_start,
                                open_end: job.open_end,
                                width,
                                cluster_prefix,
                                sums,
                                counts,
                            })
                        })
                    })
                }));
            }
            for handle in handles {
                match handle.join() {
                    Ok(result) => result?,
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(())
        })?;

        // All alignments are done (device-wide sync above); the divide
        // happens only now. A position no non-open step touched divides
        // by zero and surfaces as NaN, which closed-mode tests reject.
        Ok((0..center_len)
            .map(|t| {
                let sum = T::cell_load(&sums[t]).to_f64();
                let count = counts[t].load(Ordering::Relaxed);
                T::from_f64(sum / count as f64)
            })
            .collect())
    }
}

fn max_point_delta<T: Sample>(old: &[T], new: &[T]) -> f64 {
    old.iter()
        .zip(new)
        .map(|(a, b)| (a.to_f64() - b.to_f64()).abs())
        .fold(0.0, f64::max)
}

fn bitwise_equal<T: Sample>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.to_f64().to_bits() == y.to_f64().to_bits())
}

struct AlignMember<'a, T: Sample> {
    device: &'a crate::engine::device::Device,
    member: &'a Sequence<T>,
    member_local_index: usize,
    centroid: &'a [T],
    open_start: bool,
    open_end: bool,
    width: usize,
    cluster_prefix: &'a str,
    sums: &'a [T::AtomicCell],
    counts: &'a [AtomicU32],
}

/// DTW one member against the centroid with path storage, backtrack, and
/// pile up. Orientation: the member runs along Y unless open-end is on
/// and the centroid is shorter, in which case the pair is flipped so the
/// free tail traversal lands on the member.
fn align_member<T: Sample>(req: AlignMember<'_, T>) -> Result<(), RefineError> {
    let member_values = &req.member.values;
    let flip = req.open_end && req.centroid.len() < member_values.len();
    let (y, x): (&[T], &[T]) = if flip {
        (req.centroid, member_values)
    } else {
        (member_values, req.centroid)
    };
    let prob = DtwProblem {
        y,
        x,
        open_start: req.open_start,
        open_end: req.open_end,
        width: req.width,
    };
    let rows = prob.rows();
    let cols = prob.cols();

    let mut writer = PathFileWriter::create(
        req.cluster_prefix,
        req.member_local_index,
        &req.member.name,
    )?;

    let gauge = req.device.gauge();
    let frontier_bytes = size_of::<T>() * rows;
    let step_matrix_bytes = rows * cols;
    let full_fits =
        gauge.free() >= frontier_bytes + (step_matrix_bytes as f64 * 1.05) as usize;

    let anchor;
    {
        let mut visit = |i: usize, j: usize, code: StepCode| -> Result<(), RefineError> {
            let (c_idx, m_idx) = if flip { (i, j) } else { (j, i) };
            if code.accumulates() {
                T::cell_add(&req.sums[c_idx], member_values[m_idx]);
                req.counts[c_idx].fetch_add(1, Ordering::Relaxed);
            }
            writer.step(
                c_idx,
                req.centroid[c_idx],
                m_idx,
                member_values[m_idx],
                code,
            )?;
            Ok(())
        };

        let mut full_reservation = None;
        let full_matrix = if full_fits {
            match gauge.try_reserve(frontier_bytes + step_matrix_bytes) {
                Some(r) => {
                    full_reservation = Some(r);
                    PathMatrix::new(rows, cols).ok()
                }
                None => None,
            }
        } else {
            None
        };

        anchor = match full_matrix {
            Some(mut matrix) => {
                SwathStream::new(prob).run(&mut MatrixSink {
                    matrix: &mut matrix,
                    col0: 0,
                });
                backtrack_full(&matrix, &mut visit)?
            }
            None => {
                log::debug!(
                    "member {}: striped traceback ({}x{} step matrix does not fit)",
                    req.member.name,
                    rows,
                    cols
                );
                backtrack_striped(&prob, gauge, &mut visit)?
            }
        };
        drop(full_reservation);
    }

    // Anchor cell contribution: a plain NIL anchors the alignment at
    // (0,0) and pins member[0] to centroid[0]; an anchor reached along an
    // open path adds no weight.
    if anchor == StepCode::Nil {
        T::cell_add(&req.sums[0], member_values[0]);
        req.counts[0].fetch_add(1, Ordering::Relaxed);
    }

    writer.finish()?;
    Ok(())
}

/// Walk a full path matrix from the end corner back to the anchor,
/// feeding every non-anchor cell to `visit`. Returns the anchor code.
pub(crate) fn backtrack_full<F>(matrix: &PathMatrix, visit: &mut F) -> Result<StepCode, RefineError>
where
    F: FnMut(usize, usize, StepCode) -> Result<(), RefineError>,
{
    let mut i = (matrix.rows() - 1) as isize;
    let mut j = (matrix.cols() - 1) as isize;
    loop {
        let code = matrix.get(i as usize, j as usize);
        if code.is_anchor() {
            if i != 0 || j != 0 {
                return Err(RefineError::CorruptBacktrace { i, j });
            }
            return Ok(code);
        }
        visit(i as usize, j as usize, code)?;
        let (di, dj) = code.delta();
        i += di;
        j += dj;
        if i < 0 || j < 0 {
            return Err(RefineError::CorruptBacktrace { i, j });
        }
    }
}

/// Striped traceback: re-run the forward pass spilling each swath's edge
/// column, then recompute swaths right-to-left and walk the path inside
/// each stripe. Only the current backtrace row survives between stripes,
/// and each recomputation stops at that row, so the effective height
/// strictly decreases.
fn backtrack_striped<T: Sample, F>(
    prob: &DtwProblem<'_, T>,
    gauge: &crate::engine::device::MemoryGauge,
    visit: &mut F,
) -> Result<StepCode, RefineError>
where
    F: FnMut(usize, usize, StepCode) -> Result<(), RefineError>,
{
    let rows = prob.rows();
    let cols = prob.cols();
    let width = prob.width;
    let swaths = prob.swath_count();

    let edge_bytes = size_of::<T>() * rows * swaths;
    let _reservation = gauge.reserve_or_force(edge_bytes, "striped swath edge columns");

    let mut edges: Vec<T> = Vec::new();
    edges
        .try_reserve_exact(rows * swaths)
        .map_err(|_| RefineError::HostStripedStepMatrix { rows, cols })?;

    let mut stream = SwathStream::new(*prob);
    while stream.advance(&mut crate::engine::kernel::NoSteps).is_some() {
        edges.extend_from_slice(stream.frontier());
    }

    let stripe_cols = width.min(cols);
    let mut stripe = PathMatrix::new(rows, stripe_cols)
        .map_err(|_| RefineError::HostStripedStepMatrix { rows, cols: stripe_cols })?;

    let mut row = rows - 1;
    for k in (0..swaths).rev() {
        let col0 = k * width;
        let cols_here = (cols - col0).min(width);
        let frontier_in = if k == 0 {
            None
        } else {
            Some(&edges[(k - 1) * rows..k * rows])
        };
        replay_swath(prob, col0, row + 1, frontier_in, &mut stripe);

        let mut i = row as isize;
        let mut jl = (cols_here - 1) as isize;
        loop {
            let code = stripe.get(i as usize, jl as usize);
            if code.is_anchor() {
                let gi = i;
                let gj = col0 as isize + jl;
                if gi != 0 || gj != 0 {
                    return Err(RefineError::CorruptBacktrace { i: gi, j: gj });
                }
                return Ok(code);
            }
            visit(i as usize, col0 + jl as usize, code)?;
            let (di, dj) = code.delta();
            i += di;
            jl += dj;
            if jl < 0 {
                // Valid stripe exit: crossed the left edge with the row
                // still in range.
                if i < 0 {
                    return Err(RefineError::CorruptBacktrace { i, j: col0 as isize - 1 });
                }
                break;
            }
            if i < 0 {
                return Err(RefineError::CorruptBacktrace { i, j: col0 as isize + jl });
            }
        }
        row = i as usize;
    }
    Err(RefineError::CorruptBacktrace { i: row as isize, j: -1 })
}
