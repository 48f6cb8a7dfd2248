//! Run configuration for the barycenter engine.
//!
//! The caller hands the engine a plain configuration record plus the
//! in-memory sequences; file parsing and CLI decoding live outside this
//! crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type the engine computes in.
///
/// Distance normalization for clustering is always done in `f64`
/// regardless of this choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F64,
}

/// What the run should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgoMode {
    /// Pairwise distances, clustering and medoids only.
    ClusterOnly,
    /// Consensus only, reading cluster membership back from a previous
    /// `ClusterOnly` / `ClusterAndConsensus` run.
    ConsensusOnly,
    /// Full pipeline.
    ClusterAndConsensus,
}

#[derive(Debug, Error)]
#[error("config: Unknown algorithm mode {0} (expected 1, 2 or 3)")]
pub struct UnknownAlgoMode(pub i32);

impl TryFrom<i32> for AlgoMode {
    type Error = UnknownAlgoMode;

    fn try_from(v: i32) -> Result<Self, UnknownAlgoMode> {
        match v {
            1 => Ok(Self::ClusterOnly),
            2 => Ok(Self::ConsensusOnly),
            3 => Ok(Self::ClusterAndConsensus),
            other => Err(UnknownAlgoMode(other)),
        }
    }
}

/// Sizing of the scheduling devices the engine multiplexes work across.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePoolConfig {
    /// Number of scheduling devices. Work is distributed breadth-first
    /// (anchor `i` runs on device `i % devices`).
    pub devices: usize,
    /// Worker threads per device. `None` lets rayon size the pool.
    pub threads_per_device: Option<usize>,
    /// Swath width (DTW cost-matrix columns evaluated per kernel pass)
    /// supported by each device; the engine uses the lowest common width.
    pub max_swath_width: usize,
    /// Scratch-memory budget per device, in bytes. Allocation requests are
    /// polled against this with a 1 s back-off before degrading.
    pub memory_budget_bytes: usize,
}

impl Default for DevicePoolConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            threads_per_device: None,
            max_swath_width: 256,
            memory_budget_bytes: 1 << 30,
        }
    }
}

/// Configuration record consumed by [`crate::perform_dba`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbaConfig {
    pub dtype: Dtype,
    /// Free alignment at the start of the open axis.
    pub open_start: bool,
    /// Free alignment at the end of the open axis.
    pub open_end: bool,
    /// Prefix for every file the run writes (`{prefix}.pair_dists.txt`,
    /// `{prefix}.avg.txt`, ...).
    pub output_prefix: String,
    /// Cluster cut policy: `>1` cut at k=ceil(cdist) excluding singletons,
    /// `==1` single cluster, `[0,1)` dendrogram height cut, `<0` reserved.
    pub cdist: f64,
    pub algo_mode: AlgoMode,
    /// Z-normalize inputs before any DTW work; outputs are rescaled to the
    /// medoid's original range.
    pub norm_sequences: bool,
    pub device_pool: DevicePoolConfig,
}

impl Default for DbaConfig {
    fn default() -> Self {
        Self {
            dtype: Dtype::F64,
            open_start: false,
            open_end: false,
            output_prefix: String::from("dba"),
            cdist: 1.0,
            algo_mode: AlgoMode::ClusterAndConsensus,
            norm_sequences: false,
            device_pool: DevicePoolConfig::default(),
        }
    }
}

impl DbaConfig {
    /// Maximum refinement rounds before convergence is abandoned.
    pub const MAX_REFINEMENT_ROUNDS: usize = 250;

    pub fn open_mode(&self) -> bool {
        self.open_start || self.open_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algo_mode_from_i32() {
        assert_eq!(AlgoMode::try_from(1).unwrap(), AlgoMode::ClusterOnly);
        assert_eq!(AlgoMode::try_from(2).unwrap(), AlgoMode::ConsensusOnly);
        assert_eq!(
            AlgoMode::try_from(3).unwrap(),
            AlgoMode::ClusterAndConsensus
        );
        let err = AlgoMode::try_from(7).unwrap_err();
        assert!(err.to_string().contains("Unknown algorithm mode 7"));
    }

    #[test]
    fn default_config_is_closed_single_cluster() {
        let cfg = DbaConfig::default();
        assert!(!cfg.open_mode());
        assert_eq!(cfg.cdist, 1.0);
        assert_eq!(cfg.device_pool.devices, 1);
        assert_eq!(cfg.device_pool.max_swath_width, 256);
    }
}
