//! Swath-streamed DTW cost evaluation (White–Neely step pattern).
//!
//! The cost matrix of a sequence pair is never materialized. The kernel
//! walks the matrix in vertical swaths of `width` columns, carrying only
//! the frontier — the cumulative-cost column at the right edge of the
//! last completed swath. Within a column the update is done in place, so
//! one `rows`-long buffer is the entire cost state regardless of matrix
//! size.
//!
//! What gets persisted per visited cell is the consumer's choice: the
//! pairwise driver keeps nothing, the refiner records step codes into a
//! full or stripe-wide path matrix, and the striped traceback replays
//! single swaths from a saved frontier. Consumers express this through
//! [`StepSink`]; the kernel is monomorphized per sink so the no-op sink
//! costs nothing.

use crate::engine::step::{PathMatrix, StepCode};
use crate::sample::Sample;

/// One DTW evaluation problem. `y` runs along the matrix rows, `x` along
/// the columns; open semantics always apply to the `x` axis (callers flip
/// the pair to keep it so).
#[derive(Clone, Copy)]
pub struct DtwProblem<'a, T: Sample> {
    pub y: &'a [T],
    pub x: &'a [T],
    pub open_start: bool,
    pub open_end: bool,
    /// Swath width W; columns are processed in chunks of this many.
    pub width: usize,
}

impl<'a, T: Sample> DtwProblem<'a, T> {
    pub fn rows(&self) -> usize {
        self.y.len()
    }

    pub fn cols(&self) -> usize {
        self.x.len()
    }

    /// Number of swaths needed to cover all columns.
    pub fn swath_count(&self) -> usize {
        self.cols().div_ceil(self.width)
    }
}

/// Receiver for the step code chosen at each visited cell. `j` is always
/// the matrix-global column.
pub trait StepSink<T: Sample> {
    fn record(&mut self, i: usize, j: usize, code: StepCode);
}

/// Sink for consumers that only need costs.
pub struct NoSteps;

impl<T: Sample> StepSink<T> for NoSteps {
    #[inline(always)]
    fn record(&mut self, _i: usize, _j: usize, _code: StepCode) {}
}

/// Records steps into a path matrix whose column 0 corresponds to the
/// matrix-global column `col0` (0 for a full path matrix, the swath start
/// for a stripe).
pub struct MatrixSink<'m> {
    pub matrix: &'m mut PathMatrix,
    pub col0: usize,
}

impl<T: Sample> StepSink<T> for MatrixSink<'_> {
    #[inline(always)]
    fn record(&mut self, i: usize, j: usize, code: StepCode) {
        self.matrix.set(i, j - self.col0, code);
    }
}

/// Evaluate the swath whose first column is `col0`, restricted to rows
/// `0..row_limit`.
///
/// On entry `frontier[0..row_limit]` must hold the cumulative costs of
/// column `col0 - 1` (it is ignored when `col0 == 0`); on exit it holds
/// the costs of the swath's rightmost column. Returns the cost at
/// (`row_limit - 1`, rightmost column), which for the final swath at full
/// height is the DTW distance of the pair.
pub fn evaluate_swath<T: Sample, S: StepSink<T>>(
    prob: &DtwProblem<'_, T>,
    col0: usize,
    row_limit: usize,
    frontier: &mut [T],
    sink: &mut S,
) -> T {
    let rows = row_limit;
    let last_row = prob.y.len() - 1;
    let col_end = (col0 + prob.width).min(prob.cols());
    debug_assert!(rows >= 1 && rows <= prob.y.len());
    debug_assert!(col0 < prob.cols() && col0 % prob.width == 0);
    debug_assert!(frontier.len() >= rows);

    for j in col0..col_end {
        // In-place column update: entering row i, frontier[i] still holds
        // D(i, j-1) and diag_carry holds D(i-1, j-1).
        let mut diag_carry = T::ZERO;
        for i in 0..rows {
            let local = T::dist_sq(prob.y[i], prob.x[j]);
            let right = frontier[i];
            let mut cost;
            let mut code;
            if j == 0 {
                if i == 0 {
                    cost = local;
                    code = if prob.open_start {
                        StepCode::NilOpenRight
                    } else {
                        StepCode::Nil
                    };
                } else {
                    cost = add(local, frontier[i - 1]);
                    code = StepCode::Up;
                }
            } else if i == 0 {
                if prob.open_start {
                    cost = local;
                    code = StepCode::OpenRight;
                } else {
                    cost = add(local, right);
                    code = StepCode::Right;
                }
            } else {
                let diag = diag_carry;
                let up = frontier[i - 1];
                let mut best = diag;
                code = StepCode::Diagonal;
                if right < best {
                    best = right;
                    code = StepCode::Right;
                }
                if up < best {
                    best = up;
                    code = StepCode::Up;
                }
                cost = add(local, best);
            }
            // Open-end free extension exists only in the matrix's true
            // last row; a real move wins ties so identical sequences
            // still align diagonally.
            if prob.open_end && i == last_row && j > 0 && right < cost {
                cost = right;
                code = StepCode::OpenRight;
            }
            diag_carry = right;
            frontier[i] = cost;
            sink.record(i, j, code);
        }
    }
    frontier[rows - 1]
}

#[inline(always)]
fn add<T: Sample>(a: T, b: T) -> T {
    T::add(a, b)
}

/// Lazy producer of swaths for one DTW problem: each [`advance`] call
/// evaluates the next swath and leaves its edge column in the frontier.
///
/// [`advance`]: SwathStream::advance
pub struct SwathStream<'a, T: Sample> {
    prob: DtwProblem<'a, T>,
    frontier: Vec<T>,
    next_col: usize,
}

/// Column range covered by one completed swath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwathSpan {
    pub index: usize,
    pub col0: usize,
    pub col_end: usize,
}

impl<'a, T: Sample> SwathStream<'a, T> {
    pub fn new(prob: DtwProblem<'a, T>) -> Self {
        let rows = prob.rows();
        Self {
            prob,
            frontier: vec![T::ZERO; rows],
            next_col: 0,
        }
    }

    pub fn problem(&self) -> &DtwProblem<'a, T> {
        &self.prob
    }

    /// Edge costs of the most recently completed swath.
    pub fn frontier(&self) -> &[T] {
        &self.frontier
    }

    pub fn is_finished(&self) -> bool {
        self.next_col >= self.prob.cols()
    }

    /// Evaluate the next swath, feeding every visited cell to `sink`.
    pub fn advance<S: StepSink<T>>(&mut self, sink: &mut S) -> Option<SwathSpan> {
        if self.is_finished() {
            return None;
        }
        let col0 = self.next_col;
        let rows = self.prob.rows();
        evaluate_swath(&self.prob, col0, rows, &mut self.frontier, sink);
        let col_end = (col0 + self.prob.width).min(self.prob.cols());
        self.next_col = col_end;
        Some(SwathSpan {
            index: col0 / self.prob.width,
            col0,
            col_end,
        })
    }

    /// Drive the stream to completion and return the final pair cost
    /// (corner cost; under open-end the corner already holds the minimum
    /// over the last row).
    pub fn run<S: StepSink<T>>(&mut self, sink: &mut S) -> T {
        while self.advance(sink).is_some() {}
        self.frontier[self.prob.rows() - 1]
    }
}

/// Recompute a single swath from a saved left-edge frontier, recording
/// its steps (striped traceback support). `frontier_in` is `None` for the
/// leftmost swath.
pub fn replay_swath<T: Sample>(
    prob: &DtwProblem<'_, T>,
    col0: usize,
    row_limit: usize,
    frontier_in: Option<&[T]>,
    stripe: &mut PathMatrix,
) {
    let mut frontier = vec![T::ZERO; row_limit];
    if let Some(edge) = frontier_in {
        frontier.copy_from_slice(&edge[..row_limit]);
    }
    let mut sink = MatrixSink {
        matrix: stripe,
        col0,
    };
    evaluate_swath(prob, col0, row_limit, &mut frontier, &mut sink);
}

/// Full DTW distance of a pair with nothing persisted.
pub fn dtw_cost<T: Sample>(
    y: &[T],
    x: &[T],
    open_start: bool,
    open_end: bool,
    width: usize,
) -> T {
    let prob = DtwProblem {
        y,
        x,
        open_start,
        open_end,
        width,
    };
    SwathStream::new(prob).run(&mut NoSteps)
}
