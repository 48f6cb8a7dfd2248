//! CUDA integration (cust-based).
//!
//! The wrapper submodule is built only when the `cuda` feature is
//! enabled. The detection helpers below are always available and stay
//! defensive so they never panic on machines without a CUDA driver.

#[cfg(feature = "cuda")]
pub mod pairwise_wrapper;

#[cfg(feature = "cuda")]
pub use pairwise_wrapper::{CudaPairwise, CudaPairwiseError};

/// Returns true if a CUDA device is available and the driver API can be
/// initialized.
#[inline]
pub fn cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        use cust::{device::Device, prelude::CudaFlags};
        if cust::init(CudaFlags::empty()).is_err() {
            return false;
        }
        match Device::num_devices() {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

/// Number of CUDA devices available (0 on error or when disabled).
#[inline]
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        use cust::{device::Device, prelude::CudaFlags};
        if cust::init(CudaFlags::empty()).is_err() {
            return 0;
        }
        match Device::num_devices() {
            Ok(n) => n as usize,
            Err(_) => 0,
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_safe_without_a_device() {
        // Must never panic regardless of the machine's CUDA state.
        let available = cuda_available();
        let count = cuda_device_count();
        assert!(count > 0 || !available);
    }
}
