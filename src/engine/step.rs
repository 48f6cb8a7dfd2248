//! Step codes recorded during cost evaluation and the pitched matrix that
//! stores them for backtracking.

use thiserror::Error;

/// One backtracking step recorded per visited cell.
///
/// `OpenRight` is a right move that accumulated no cost (open traversal);
/// `Nil` anchors the alignment and terminates backtracking;
/// `NilOpenRight` is an anchor reached along an open path and contributes
/// no consensus weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepCode {
    Nil = 0,
    Diagonal = 1,
    Right = 2,
    Up = 3,
    OpenRight = 4,
    NilOpenRight = 5,
}

/// Row delta applied when backtracking through a step, indexed by code.
pub const MOVE_I: [isize; 6] = [0, -1, 0, -1, 0, 0];
/// Column delta applied when backtracking through a step, indexed by code.
pub const MOVE_J: [isize; 6] = [0, -1, -1, 0, -1, 0];

impl StepCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nil),
            1 => Some(Self::Diagonal),
            2 => Some(Self::Right),
            3 => Some(Self::Up),
            4 => Some(Self::OpenRight),
            5 => Some(Self::NilOpenRight),
            _ => None,
        }
    }

    pub fn is_anchor(self) -> bool {
        matches!(self, Self::Nil | Self::NilOpenRight)
    }

    /// Whether a backtrace passing through this step contributes to the
    /// consensus pile-up.
    pub fn accumulates(self) -> bool {
        !matches!(self, Self::OpenRight | Self::NilOpenRight)
    }

    pub fn delta(self) -> (isize, isize) {
        let idx = self as usize;
        (MOVE_I[idx], MOVE_J[idx])
    }

    /// Name used in alignment path files.
    pub fn label(self) -> &'static str {
        match self {
            Self::Nil => "NIL",
            Self::Diagonal => "DIAG",
            Self::Right => "RIGHT",
            Self::Up => "UP",
            Self::OpenRight => "OPEN_RIGHT",
            Self::NilOpenRight => "NIL_OPEN_RIGHT",
        }
    }

    /// Single-letter form used in step-matrix dumps.
    pub fn letter(self) -> char {
        match self {
            Self::Diagonal => 'D',
            Self::Right => 'R',
            Self::Up => 'U',
            Self::OpenRight => 'O',
            Self::Nil | Self::NilOpenRight => 'N',
        }
    }
}

#[derive(Debug, Error)]
pub enum PathMatrixError {
    #[error("path: Cannot allocate a {rows}x{cols} step matrix ({bytes} bytes)")]
    Allocation {
        rows: usize,
        cols: usize,
        bytes: usize,
    },
}

/// Step-code matrix with pitched row storage. Rows are padded to a
/// 256-byte multiple so row starts stay aligned regardless of width.
pub struct PathMatrix {
    steps: Vec<u8>,
    pitch: usize,
    rows: usize,
    cols: usize,
}

const ROW_ALIGN: usize = 256;

impl PathMatrix {
    pub fn new(rows: usize, cols: usize) -> Result<Self, PathMatrixError> {
        let pitch = cols.div_ceil(ROW_ALIGN) * ROW_ALIGN;
        let bytes = pitch * rows;
        let mut steps = Vec::new();
        steps
            .try_reserve_exact(bytes)
            .map_err(|_| PathMatrixError::Allocation { rows, cols, bytes })?;
        steps.resize(bytes, StepCode::Nil as u8);
        Ok(Self {
            steps,
            pitch,
            rows,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, code: StepCode) {
        debug_assert!(i < self.rows && j < self.cols);
        self.steps[i * self.pitch + j] = code as u8;
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> StepCode {
        debug_assert!(i < self.rows && j < self.cols);
        // Cells are only ever written through `set`, so the byte is always
        // a valid code.
        StepCode::from_u8(self.steps[i * self.pitch + j]).unwrap_or(StepCode::Nil)
    }

    /// Render rows of step letters, one line per matrix row.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.rows * (self.cols + 1));
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.push(self.get(i, j).letter());
            }
            out.push('\n');
        }
        out
    }
}
