//! Top-level error type and process exit codes.
//!
//! Each pipeline stage has its own error enum; this aggregates them for
//! callers that drive the whole run and maps every failure to a distinct
//! process exit code.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::UnknownAlgoMode;
use crate::engine::chop::ChopError;
use crate::engine::device::DeviceError;
use crate::engine::pairwise::PairwiseError;
use crate::engine::refine::RefineError;
use crate::utilities::checkpoint::CheckpointError;

/// Process exit codes, one per failure class.
pub mod exit_code {
    pub const CANNOT_ALLOCATE_PAIRWISE_DIST_ARRAY: i32 = 1;
    pub const CANNOT_WRITE_DISTANCE_MATRIX: i32 = 2;
    pub const CANNOT_WRITE_MEMBERSHIP: i32 = 3;
    pub const CANNOT_WRITE_DBA_AVG: i32 = 4;
    pub const CANNOT_WRITE_DTW_PATH: i32 = 5;
    pub const MEDOID_FINDING_ERROR: i32 = 6;
    pub const MEMCPY_FAILURE: i32 = 7;
    pub const CANNOT_COPY_PREFIX_CHOPPED_SEQ: i32 = 8;
    pub const UNKNOWN_ALGO: i32 = 9;
    pub const CANNOT_WRITE_UPDATED_SIGNAL_ARCHIVE: i32 = 10;
    pub const CANNOT_ALLOCATE_HOST_STRIPED_STEP_MATRIX: i32 = 11;
    pub const CANNOT_READ_MEMBERSHIP: i32 = 12;
    pub const CORRUPT_PATH_MATRIX: i32 = 13;
    pub const DEVICE_SETUP_FAILURE: i32 = 14;
    pub const CLUSTER_POLICY_RESERVED: i32 = 15;
}

#[derive(Debug, Error)]
pub enum DbaError {
    #[error(transparent)]
    Config(#[from] UnknownAlgoMode),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Refine(#[from] RefineError),
    #[error(transparent)]
    Chop(#[from] ChopError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl DbaError {
    /// Distinct process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        use crate::utilities::output::OutputError;
        match self {
            Self::Config(_) => exit_code::UNKNOWN_ALGO,
            Self::Device(_) => exit_code::DEVICE_SETUP_FAILURE,
            Self::Pairwise(PairwiseError::Allocation { .. }) => {
                exit_code::CANNOT_ALLOCATE_PAIRWISE_DIST_ARRAY
            }
            Self::Pairwise(PairwiseError::WriteMatrix { .. }) => {
                exit_code::CANNOT_WRITE_DISTANCE_MATRIX
            }
            Self::Pairwise(PairwiseError::Device(_)) => exit_code::DEVICE_SETUP_FAILURE,
            Self::Cluster(ClusterError::ReservedPolicy(_)) => exit_code::CLUSTER_POLICY_RESERVED,
            Self::Cluster(ClusterError::MedoidLogic { .. }) => exit_code::MEDOID_FINDING_ERROR,
            Self::Cluster(ClusterError::WriteMembership { .. }) => {
                exit_code::CANNOT_WRITE_MEMBERSHIP
            }
            Self::Cluster(
                ClusterError::ReadMembership { .. }
                | ClusterError::MembershipFormat { .. }
                | ClusterError::MembershipMissing { .. },
            ) => exit_code::CANNOT_READ_MEMBERSHIP,
            Self::Refine(RefineError::Path(_)) => exit_code::CANNOT_WRITE_DTW_PATH,
            Self::Refine(RefineError::HostStripedStepMatrix { .. }) => {
                exit_code::CANNOT_ALLOCATE_HOST_STRIPED_STEP_MATRIX
            }
            Self::Refine(RefineError::CorruptBacktrace { .. }) => exit_code::CORRUPT_PATH_MATRIX,
            Self::Refine(RefineError::Device(_)) => exit_code::DEVICE_SETUP_FAILURE,
            Self::Chop(ChopError::Report(OutputError::WriteChop { .. })) => {
                exit_code::CANNOT_WRITE_DTW_PATH
            }
            Self::Chop(ChopError::Report(OutputError::WritePath { .. })) => {
                exit_code::CANNOT_WRITE_DTW_PATH
            }
            Self::Chop(ChopError::StepMatrix(_)) => {
                exit_code::CANNOT_ALLOCATE_HOST_STRIPED_STEP_MATRIX
            }
            Self::Chop(ChopError::CopyChoppedSequence { .. }) => {
                exit_code::CANNOT_COPY_PREFIX_CHOPPED_SEQ
            }
            Self::Chop(ChopError::CorruptBacktrace { .. }) => exit_code::CORRUPT_PATH_MATRIX,
            Self::Chop(ChopError::Device(_)) => exit_code::DEVICE_SETUP_FAILURE,
            Self::Checkpoint(_) => exit_code::CANNOT_WRITE_DBA_AVG,
        }
    }
}
