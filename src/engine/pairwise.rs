//! All-pairs DTW distance driver.
//!
//! For each anchor sequence `i` the driver issues one grid of `N - i - 1`
//! partner evaluations (every `j > i`) on device `i % D`, each anchor on
//! its own prioritized stream. Sequences arrive sorted ascending by
//! length, so the anchor is the shorter member of every pair it appears
//! in and the cost frontier has the minimal length. Frontier memory for
//! the whole grid is reserved against the device gauge up front (with the
//! 1 s back-off) and released by a cleanup callback when the stream
//! drains.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use rayon::prelude::*;
use thiserror::Error;

use crate::engine::device::{DeviceError, DevicePool, Stream};
use crate::engine::kernel::dtw_cost;
use crate::sample::Sample;
use crate::sequences::Sequence;
use crate::utilities::progress::ProgressSink;

#[derive(Debug, Error)]
pub enum PairwiseError {
    #[error("pairwise: Cannot allocate the pairwise distance vector ({pairs} pairs)")]
    Allocation { pairs: usize },
    #[error("pairwise: Cannot write distance matrix {}: {source}", .path.display())]
    WriteMatrix {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Offset of row `i` inside the flat upper-triangular distance vector of
/// `n` sequences; the row spans `n - i - 1` entries.
#[inline]
pub fn pairwise_row(i: usize, n: usize) -> usize {
    i * n - i * (i + 1) / 2
}

/// Flat upper-triangular vector of the DTW distance of every unordered
/// pair; only (i, j) with i < j are stored, self-distance is implicitly 0.
#[derive(Debug, Clone)]
pub struct PairwiseDistances<T: Sample> {
    n: usize,
    values: Vec<T>,
}

impl<T: Sample> PairwiseDistances<T> {
    pub fn new(n: usize) -> Result<Self, PairwiseError> {
        let pairs = if n < 2 { 0 } else { n * (n - 1) / 2 };
        let mut values = Vec::new();
        values
            .try_reserve_exact(pairs)
            .map_err(|_| PairwiseError::Allocation { pairs })?;
        values.resize(pairs, T::ZERO);
        Ok(Self { n, values })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        debug_assert!(i < j && j < self.n);
        self.values[pairwise_row(i, self.n) + j - i - 1]
    }

    pub(crate) fn set_row(&mut self, i: usize, row: &[T]) {
        let off = pairwise_row(i, self.n);
        self.values[off..off + row.len()].copy_from_slice(row);
    }

    /// Largest stored distance, or zero when nothing is stored.
    pub fn max_distance(&self) -> T {
        let mut max = T::ZERO;
        for &v in &self.values {
            if v > max {
                max = v;
            }
        }
        max
    }
}

/// Compute the upper-triangular DTW distance vector for `sequences`
/// (already sorted ascending by length).
pub fn compute_pairwise<T: Sample>(
    sequences: &Arc<Vec<Sequence<T>>>,
    open_start: bool,
    open_end: bool,
    pool: &DevicePool,
    progress: &mut dyn ProgressSink,
) -> Result<PairwiseDistances<T>, PairwiseError> {
    let n = sequences.len();
    let mut distances = PairwiseDistances::new(n)?;
    if n < 2 {
        return Ok(distances);
    }

    let width = pool.common_swath_width();
    let (row_tx, row_rx) = mpsc::channel::<(usize, Vec<T>)>();
    // Bounded window of live streams per device; popping joins the oldest.
    let mut live: VecDeque<Stream> = VecDeque::new();
    let window = 2 * pool.len();

    progress.begin("computing all-pairs DTW distances");
    for i in 0..n - 1 {
        let device = pool.device_for(i);
        let grid = n - i - 1;
        let frontier_bytes = size_of::<T>() * sequences[i].len() * grid;
        let reservation = device
            .gauge()
            .reserve_with_backoff(frontier_bytes, "pairwise cost frontier");

        let stream = device.create_stream(pool.next_priority())?;
        let workers = device.pool_handle();
        let seqs = Arc::clone(sequences);
        let tx = row_tx.clone();
        stream.launch(move || {
            let anchor = &seqs[i].values;
            let row: Vec<T> = workers.install(|| {
                (i + 1..seqs.len())
                    .into_par_iter()
                    .map(|j| dtw_cost(anchor, &seqs[j].values, open_start, open_end, width))
                    .collect()
            });
            let _ = tx.send((i, row));
        });
        stream.add_cleanup_callback(move || drop(reservation));

        live.push_back(stream);
        while live.len() > window {
            live.pop_front();
        }
    }
    drop(row_tx);

    let mut done = 0usize;
    for (i, row) in row_rx {
        distances.set_row(i, &row);
        done += 1;
        progress.update(done, n - 1);
    }
    drop(live);
    progress.end();

    Ok(distances)
}

/// Write `{prefix}.pair_dists.txt`: row `i` holds the sequence name, `i`
/// empty fields, the `0` self-distance, then the stored distances of row
/// `i`. The final row carries only the padded self-distance. Values are
/// the raw sum-of-squares DTW costs.
pub fn write_pair_dists<T: Sample>(
    output_prefix: &str,
    sequences: &[Sequence<T>],
    distances: &PairwiseDistances<T>,
) -> Result<(), PairwiseError> {
    let path = Path::new(&format!("{output_prefix}.pair_dists.txt")).to_path_buf();
    let file = File::create(&path).map_err(|source| PairwiseError::WriteMatrix {
        path: path.clone(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    let n = sequences.len();
    let mut write = || -> std::io::Result<()> {
        for i in 0..n.saturating_sub(1) {
            out.write_all(sequences[i].name.as_bytes())?;
            for _ in 0..i {
                out.write_all(b"\t")?;
            }
            out.write_all(b"\t0")?;
            for j in i + 1..n {
                write!(out, "\t{}", distances.get(i, j))?;
            }
            out.write_all(b"\n")?;
        }
        if let Some(last) = sequences.last() {
            out.write_all(last.name.as_bytes())?;
            for _ in 0..n {
                out.write_all(b"\t")?;
            }
            out.write_all(b"0\n")?;
        }
        out.flush()
    };
    write().map_err(|source| PairwiseError::WriteMatrix { path, source })
}
