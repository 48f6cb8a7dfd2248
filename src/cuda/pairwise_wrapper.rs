//! CUDA scaffolding for the all-pairs DTW distance driver.
//!
//! VRAM-first design: each anchor's partner set is flattened into one
//! padded device buffer, the per-pair cost frontiers live on the device
//! across swath launches, and only the final per-pair costs come back to
//! the host. Swath launches for one anchor are queued back-to-back on a
//! prioritized non-blocking stream, mirroring the host engine's
//! per-anchor streams. The kernel computes in `f32`; callers needing
//! `f64` semantics use the host engine.

#![cfg(feature = "cuda")]

use cust::context::Context;
use cust::device::Device;
use cust::function::{BlockSize, GridSize};
use cust::memory::{CopyDestination, DeviceBuffer};
use cust::module::Module;
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::ffi::c_void;
use std::fmt;

use crate::engine::pairwise::{pairwise_row, PairwiseDistances};
use crate::sequences::Sequence;

#[derive(Debug)]
pub enum CudaPairwiseError {
    Cuda(String),
    InvalidInput(String),
}

impl fmt::Display for CudaPairwiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CudaPairwiseError::Cuda(e) => write!(f, "CUDA error: {}", e),
            CudaPairwiseError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for CudaPairwiseError {}

pub struct CudaPairwise {
    module: Module,
    stream: Stream,
    _context: Context,
}

impl CudaPairwise {
    pub fn new(device_id: usize) -> Result<Self, CudaPairwiseError> {
        cust::init(CudaFlags::empty()).map_err(|e| CudaPairwiseError::Cuda(e.to_string()))?;
        let device = Device::get_device(device_id as u32)
            .map_err(|e| CudaPairwiseError::Cuda(e.to_string()))?;
        let context = Context::new(device).map_err(|e| CudaPairwiseError::Cuda(e.to_string()))?;

        let ptx: &str = include_str!(concat!(env!("OUT_DIR"), "/dtw_swath.ptx"));
        let module =
            Module::from_ptx(ptx, &[]).map_err(|e| CudaPairwiseError::Cuda(e.to_string()))?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, Some(-1))
            .map_err(|e| CudaPairwiseError::Cuda(e.to_string()))?;

        Ok(Self {
            module,
            stream,
            _context: context,
        })
    }

    /// Upper-triangular pairwise distance vector for `sequences`
    /// (sorted ascending by length), matching the host engine within
    /// `f32` tolerance.
    pub fn pairwise(
        &self,
        sequences: &[Sequence<f32>],
        open_start: bool,
        open_end: bool,
        swath_width: usize,
    ) -> Result<PairwiseDistances<f32>, CudaPairwiseError> {
        let n = sequences.len();
        if sequences.iter().any(Sequence::is_empty) {
            return Err(CudaPairwiseError::InvalidInput(
                "empty sequences cannot be aligned".into(),
            ));
        }
        let mut distances = PairwiseDistances::new(n)
            .map_err(|e| CudaPairwiseError::InvalidInput(e.to_string()))?;
        if n < 2 {
            return Ok(distances);
        }
        let width = swath_width.max(1);

        for i in 0..n - 1 {
            let row = self.anchor_row(sequences, i, open_start, open_end, width)?;
            debug_assert_eq!(pairwise_row(i, n) + row.len(), pairwise_row(i + 1, n));
            distances.set_row(i, &row);
        }
        Ok(distances)
    }

    /// All distances of anchor `i` against every partner `j > i`.
    fn anchor_row(
        &self,
        sequences: &[Sequence<f32>],
        anchor_index: usize,
        open_start: bool,
        open_end: bool,
        width: usize,
    ) -> Result<Vec<f32>, CudaPairwiseError> {
        let cuda = |e: cust::error::CudaError| CudaPairwiseError::Cuda(e.to_string());
        let n = sequences.len();
        let anchor = &sequences[anchor_index].values;
        let num_pairs = n - anchor_index - 1;

        let partner_stride = sequences[anchor_index + 1..]
            .iter()
            .map(Sequence::len)
            .max()
            .unwrap_or(0);
        let mut partners_flat = vec![0f32; num_pairs * partner_stride];
        let mut partner_lens = vec![0usize; num_pairs];
        let mut max_partner_len = 0usize;
        for (k, seq) in sequences[anchor_index + 1..].iter().enumerate() {
            partners_flat[k * partner_stride..k * partner_stride + seq.len()]
                .copy_from_slice(&seq.values);
            partner_lens[k] = seq.len();
            max_partner_len = max_partner_len.max(seq.len());
        }

        let d_anchor = DeviceBuffer::from_slice(anchor).map_err(cuda)?;
        let d_partners = DeviceBuffer::from_slice(&partners_flat).map_err(cuda)?;
        let d_lens = DeviceBuffer::from_slice(&partner_lens).map_err(cuda)?;
        let d_frontier =
            unsafe { DeviceBuffer::<f32>::uninitialized(num_pairs * anchor.len()) }
                .map_err(cuda)?;
        let mut d_costs =
            unsafe { DeviceBuffer::<f32>::uninitialized(num_pairs) }.map_err(cuda)?;

        let func = self
            .module
            .get_function("dtw_swath_f32")
            .map_err(cuda)?;
        let block_x: u32 = 128;
        let grid_x = ((num_pairs as u32) + block_x - 1) / block_x;
        let grid: GridSize = (grid_x.max(1), 1, 1).into();
        let block: BlockSize = (block_x, 1, 1).into();

        let mut col_offset = 0usize;
        while col_offset < max_partner_len {
            unsafe {
                let mut anchor_ptr = d_anchor.as_device_ptr().as_raw();
                let mut anchor_len = anchor.len();
                let mut partners_ptr = d_partners.as_device_ptr().as_raw();
                let mut lens_ptr = d_lens.as_device_ptr().as_raw();
                let mut stride = partner_stride;
                let mut pairs = num_pairs;
                let mut offset = col_offset;
                let mut swath = width;
                let mut frontier_ptr = d_frontier.as_device_ptr().as_raw();
                let mut costs_ptr = d_costs.as_device_ptr().as_raw();
                let mut open_start_i = i32::from(open_start);
                let mut open_end_i = i32::from(open_end);

                let args: &mut [*mut c_void] = &mut [
                    &mut anchor_ptr as *mut _ as *mut c_void,
                    &mut anchor_len as *mut _ as *mut c_void,
                    &mut partners_ptr as *mut _ as *mut c_void,
                    &mut lens_ptr as *mut _ as *mut c_void,
                    &mut stride as *mut _ as *mut c_void,
                    &mut pairs as *mut _ as *mut c_void,
                    &mut offset as *mut _ as *mut c_void,
                    &mut swath as *mut _ as *mut c_void,
                    &mut frontier_ptr as *mut _ as *mut c_void,
                    &mut costs_ptr as *mut _ as *mut c_void,
                    &mut open_start_i as *mut _ as *mut c_void,
                    &mut open_end_i as *mut _ as *mut c_void,
                ];
                self.stream.launch(&func, grid, block, 0, args).map_err(cuda)?;
            }
            col_offset += width;
        }
        self.stream.synchronize().map_err(cuda)?;

        let mut row = vec![0f32; num_pairs];
        d_costs.copy_to(&mut row).map_err(cuda)?;
        Ok(row)
    }
}
