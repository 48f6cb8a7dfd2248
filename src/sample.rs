//! Numeric element abstraction.
//!
//! The engine is generic over the sequence element type; `f32` and `f64`
//! are the two supported instantiations. Centroid pile-up buffers need
//! lock-free accumulation from concurrently backtracking members, so each
//! element type carries an atomic cell representation (a CAS loop over the
//! IEEE bit pattern).

use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A sequence element the DTW engine can compute with.
pub trait Sample:
    Copy + PartialOrd + Display + Debug + FromStr + Send + Sync + 'static
{
    const ZERO: Self;
    const MAX: Self;

    /// Atomic accumulator cell holding one `Self` as its bit pattern.
    type AtomicCell: Send + Sync;

    fn zeroed_cells(len: usize) -> Vec<Self::AtomicCell>;
    fn cell_add(cell: &Self::AtomicCell, v: Self);
    fn cell_load(cell: &Self::AtomicCell) -> Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn is_nan(self) -> bool;

    /// Squared-difference local cost.
    fn dist_sq(a: Self, b: Self) -> Self;

    /// Cost accumulation in the element type's own precision.
    fn add(a: Self, b: Self) -> Self;

    /// Values at or above this threshold in the final position of an input
    /// are treated as upstream overflow artifacts and truncated.
    fn overflow_guard() -> Self {
        Self::from_f64(Self::MAX.to_f64().sqrt())
    }
}

impl Sample for f32 {
    const ZERO: Self = 0.0;
    const MAX: Self = f32::MAX;

    type AtomicCell = AtomicU32;

    fn zeroed_cells(len: usize) -> Vec<AtomicU32> {
        (0..len).map(|_| AtomicU32::new(0.0f32.to_bits())).collect()
    }

    fn cell_add(cell: &AtomicU32, v: f32) {
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + v).to_bits();
            match cell.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn cell_load(cell: &AtomicU32) -> f32 {
        f32::from_bits(cell.load(Ordering::Relaxed))
    }

    fn from_f64(v: f64) -> f32 {
        v as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }

    fn dist_sq(a: f32, b: f32) -> f32 {
        let d = a - b;
        d * d
    }

    fn add(a: f32, b: f32) -> f32 {
        a + b
    }
}

impl Sample for f64 {
    const ZERO: Self = 0.0;
    const MAX: Self = f64::MAX;

    type AtomicCell = AtomicU64;

    fn zeroed_cells(len: usize) -> Vec<AtomicU64> {
        (0..len).map(|_| AtomicU64::new(0.0f64.to_bits())).collect()
    }

    fn cell_add(cell: &AtomicU64, v: f64) {
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + v).to_bits();
            match cell.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn cell_load(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    fn from_f64(v: f64) -> f64 {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }

    fn dist_sq(a: f64, b: f64) -> f64 {
        let d = a - b;
        d * d
    }

    fn add(a: f64, b: f64) -> f64 {
        a + b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn dist_sq_is_squared_difference() {
        assert_eq!(f64::dist_sq(3.0, 1.0), 4.0);
        assert_eq!(f32::dist_sq(-2.0, 2.0), 16.0);
    }

    #[test]
    fn atomic_cells_accumulate_across_threads() {
        let cells = Arc::new(f64::zeroed_cells(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cells = Arc::clone(&cells);
            handles.push(thread::spawn(move || {
                for t in 0..4 {
                    for _ in 0..1000 {
                        f64::cell_add(&cells[t], 0.5);
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("accumulator thread panicked");
        }
        for t in 0..4 {
            assert_eq!(f64::cell_load(&cells[t]), 4000.0, "lost update at {t}");
        }
    }

    #[test]
    fn overflow_guard_is_sqrt_of_max() {
        assert!(f32::overflow_guard() < f32::MAX);
        let g = f64::overflow_guard();
        assert!((g * g).is_finite() || g * g >= f64::MAX / 2.0);
    }
}
