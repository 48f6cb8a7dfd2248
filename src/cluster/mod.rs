//! Sequence clustering and medoid selection on top of the pairwise DTW
//! distances.

pub mod linkage;
pub mod medoid;

pub use linkage::{cluster_memberships, normalize_distances, ClusterError};
pub use medoid::{read_membership, select_medoids, write_membership};

/// Number of clusters implied by a dense membership array.
pub fn cluster_count(memberships: &[usize]) -> usize {
    memberships.iter().copied().max().map_or(0, |m| m + 1)
}
