//! Complete-linkage clustering of the normalized distance vector.
//!
//! The dendrogram primitive is `kodama`; the cut policies on top of it
//! follow the `cdist` contract: `cdist > 1` cuts at k = ceil(cdist) while
//! iteratively raising k until at least that many clusters have two or
//! more members, `cdist == 1` short-circuits to a single cluster (two-leaf
//! dendrograms degenerate under a height cut), `0 <= cdist < 1` cuts the
//! dendrogram at that height, and negative values are reserved for a
//! permutation-statistics strategy that is not implemented.

use std::collections::HashMap;
use std::path::PathBuf;

use kodama::{linkage, Dendrogram, Method};
use thiserror::Error;

use crate::engine::pairwise::PairwiseDistances;
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster: cdist {0} is negative; permutation-statistics clustering is reserved")]
    ReservedPolicy(f64),
    #[error("cluster: Logic error in medoid finding routine for cluster {cluster}")]
    MedoidLogic { cluster: usize },
    #[error("cluster: Cannot write membership file {}: {source}", .path.display())]
    WriteMembership {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cluster: Cannot read membership file {}: {source}", .path.display())]
    ReadMembership {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cluster: Membership file {} line {line} is malformed", .path.display())]
    MembershipFormat { path: PathBuf, line: usize },
    #[error("cluster: Membership file {} does not cover sequence {name}", .path.display())]
    MembershipMissing { path: PathBuf, name: String },
}

/// Map distances into [0,1] by dividing by the observed maximum, in
/// double precision as the clustering primitive requires. A zero maximum
/// (all sequences identical) is clamped to 1 so the division is a no-op.
pub fn normalize_distances<T: Sample>(distances: &PairwiseDistances<T>) -> Vec<f64> {
    let mut max = distances.max_distance().to_f64();
    if max == 0.0 {
        max = 1.0;
    }
    distances.values().iter().map(|v| v.to_f64() / max).collect()
}

/// Dense memberships (`0..K-1`) for `n` sequences under the `cdist`
/// policy. `condensed` is the normalized upper-triangular vector and is
/// consumed as the linkage workspace.
pub fn cluster_memberships(
    mut condensed: Vec<f64>,
    n: usize,
    cdist: f64,
) -> Result<Vec<usize>, ClusterError> {
    if cdist < 0.0 {
        return Err(ClusterError::ReservedPolicy(cdist));
    }
    if n <= 1 || cdist == 1.0 {
        return Ok(vec![0; n]);
    }

    let dendrogram = linkage(&mut condensed, n, Method::Complete);

    if cdist > 1.0 {
        let requested = (cdist.ceil() as usize).min(n);
        log::info!("using k-means style clustering (excluding singletons), k={requested}");
        let mut k = requested;
        loop {
            let memberships = cut_k(&dendrogram, n, k);
            let clusters = super::cluster_count(&memberships);
            let mut sizes = vec![0usize; clusters];
            for &m in &memberships {
                sizes[m] += 1;
            }
            let multimember = sizes.iter().filter(|&&s| s > 1).count();
            if multimember >= requested || k >= n {
                log::info!("final k to compensate for singletons: {k}");
                return Ok(memberships);
            }
            k = (k + requested - multimember).min(n);
        }
    }

    log::info!("using dendrogram fixed height clustering cutoff {cdist}");
    Ok(cut_height(&dendrogram, n, cdist))
}

/// Cut after applying all merge steps below `height`.
pub fn cut_height(dendrogram: &Dendrogram<f64>, n: usize, height: f64) -> Vec<usize> {
    let steps = dendrogram
        .steps()
        .iter()
        .take_while(|s| s.dissimilarity < height)
        .count();
    assignments(dendrogram, n, steps)
}

/// Cut so that `k` clusters remain.
pub fn cut_k(dendrogram: &Dendrogram<f64>, n: usize, k: usize) -> Vec<usize> {
    let steps = n.saturating_sub(k.max(1)).min(dendrogram.steps().len());
    assignments(dendrogram, n, steps)
}

/// Apply the first `steps` merges and label the resulting clusters
/// densely in order of first appearance by ascending sequence index.
fn assignments(dendrogram: &Dendrogram<f64>, n: usize, steps: usize) -> Vec<usize> {
    // Leaves are 0..n-1; the i-th merge step creates cluster n+i.
    let mut parent: Vec<usize> = (0..n + steps).collect();
    for (idx, step) in dendrogram.steps().iter().take(steps).enumerate() {
        parent[step.cluster1] = n + idx;
        parent[step.cluster2] = n + idx;
    }
    let mut labels: HashMap<usize, usize> = HashMap::new();
    let mut memberships = Vec::with_capacity(n);
    for leaf in 0..n {
        let mut root = leaf;
        while parent[root] != root {
            root = parent[root];
        }
        let next = labels.len();
        memberships.push(*labels.entry(root).or_insert(next));
    }
    memberships
}
