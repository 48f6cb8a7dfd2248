//! Leader-prefix location and chopping.
//!
//! Each input is matched against a fixed leader prefix with open-end DTW
//! (prefix on the rows, input on the columns): the backtrace's OPEN_RIGHT
//! run pins down where the prefix ends inside the input, everything up to
//! that column is trimmed, and a histogram records how many input
//! positions aligned to each prefix position. Inputs that would become
//! empty are dropped and the collection compacted in place.

use std::thread;

use rayon::prelude::*;
use thiserror::Error;

use crate::engine::device::{DeviceError, DevicePool};
use crate::engine::kernel::{DtwProblem, MatrixSink, SwathStream};
use crate::engine::step::{PathMatrix, PathMatrixError, StepCode};
use crate::sample::Sample;
use crate::sequences::Sequence;
use crate::utilities::output::{ChopReportWriter, OutputError};
use crate::utilities::progress::ProgressSink;

#[derive(Debug, Error)]
pub enum ChopError {
    #[error(transparent)]
    Report(#[from] OutputError),
    #[error(transparent)]
    StepMatrix(#[from] PathMatrixError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("chop: Cannot copy prefix-chopped sequence {name}")]
    CopyChoppedSequence { name: String },
    #[error("chop: Backtrace left the prefix path matrix at (i={i}, j={j})")]
    CorruptBacktrace { i: isize, j: isize },
}

/// Where the leader ends in one input, plus the per-prefix-position
/// alignment pileup.
#[derive(Debug, Clone)]
struct ChopLocation {
    chop_pos: usize,
    histogram: Vec<u32>,
}

/// Locate and trim the leader `prefix` from every sequence, writing
/// `{prefix}.prefix_chop.txt`. Sequences emptied by the chop are removed.
pub fn chop_prefix<T: Sample>(
    prefix: &Sequence<T>,
    sequences: &mut Vec<Sequence<T>>,
    output_prefix: &str,
    pool: &DevicePool,
    progress: &mut dyn ProgressSink,
) -> Result<(), ChopError> {
    if prefix.is_empty() || sequences.is_empty() {
        return Ok(());
    }
    let width = pool.common_swath_width();

    progress.begin("locating leader prefix in inputs");
    let mut locations: Vec<Option<ChopLocation>> = vec![None; sequences.len()];
    thread::scope(|scope| -> Result<(), ChopError> {
        let mut handles = Vec::with_capacity(pool.len());
        for d in 0..pool.len() {
            let jobs: Vec<(usize, &Sequence<T>)> = sequences
                .iter()
                .enumerate()
                .filter(|(i, _)| i % pool.len() == d)
                .collect();
            if jobs.is_empty() {
                continue;
            }
            let prefix = &prefix.values;
            handles.push(scope.spawn(
                move || -> Result<Vec<(usize, ChopLocation)>, ChopError> {
                    let device = pool.device(d);
                    device.pool().install(|| {
                        jobs.into_par_iter()
                            .map(|(index, seq)| {
                                locate_chop(prefix, &seq.values, width, device)
                                    .map(|loc| (index, loc))
                            })
                            .collect()
                    })
                },
            ));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => {
                    for (index, loc) in result? {
                        locations[index] = Some(loc);
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok(())
    })?;
    progress.end();

    let mut report = ChopReportWriter::create(output_prefix)?;
    let mut kept: Vec<Sequence<T>> = Vec::with_capacity(sequences.len());
    for (seq, loc) in sequences.drain(..).zip(locations) {
        // Every job either filled its slot or errored out above.
        let Some(loc) = loc else { continue };
        report.row(&seq.name, loc.chop_pos, seq.len(), &loc.histogram)?;
        let chopped_len = seq.len() - loc.chop_pos;
        if chopped_len == 0 {
            log::info!(
                "skipping {} due to zero length after prefix chopping",
                seq.name
            );
            continue;
        }
        let mut values = Vec::new();
        if values.try_reserve_exact(chopped_len).is_err() {
            return Err(ChopError::CopyChoppedSequence { name: seq.name });
        }
        values.extend_from_slice(&seq.values[loc.chop_pos..]);
        kept.push(Sequence::new(seq.name, values));
    }
    report.finish()?;
    *sequences = kept;
    Ok(())
}

/// Open-end DTW of the prefix against one input and the backtrace that
/// yields the chop column and leader histogram.
fn locate_chop<T: Sample>(
    prefix: &[T],
    input: &[T],
    width: usize,
    device: &crate::engine::device::Device,
) -> Result<ChopLocation, ChopError> {
    let rows = prefix.len();
    let cols = input.len();
    let prob = DtwProblem {
        y: prefix,
        x: input,
        open_start: false,
        open_end: true,
        width,
    };

    let _reservation = device
        .gauge()
        .reserve_or_force(rows * cols, "prefix chop path matrix");
    let mut matrix = PathMatrix::new(rows, cols)?;
    SwathStream::new(prob).run(&mut MatrixSink {
        matrix: &mut matrix,
        col0: 0,
    });

    let mut i = (rows - 1) as isize;
    let mut j = (cols - 1) as isize;
    let mut code = matrix.get(i as usize, j as usize);
    // The free tail of the open-end match: walk left until the last cell
    // the prefix actually aligned to.
    while code == StepCode::OpenRight {
        j -= 1;
        code = matrix.get(i as usize, j as usize);
    }
    let chop_pos = j as usize;

    let mut histogram = vec![0u32; rows];
    histogram[i as usize] = 1;
    while code != StepCode::Nil {
        let (di, dj) = code.delta();
        i += di;
        j += dj;
        if i < 0 || j < 0 {
            return Err(ChopError::CorruptBacktrace { i, j });
        }
        histogram[i as usize] += 1;
        code = matrix.get(i as usize, j as usize);
    }

    Ok(ChopLocation { chop_pos, histogram })
}
