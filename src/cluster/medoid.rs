//! Medoid selection and the cluster membership file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::linkage::ClusterError;
use crate::engine::pairwise::PairwiseDistances;
use crate::sample::Sample;
use crate::sequences::Sequence;

/// Pick one medoid per cluster.
///
/// Clusters of three or more use the member with the minimum sum of
/// squared distances to its co-members; two-member clusters take the
/// longer sequence; singletons are their own medoid.
pub fn select_medoids<T: Sample>(
    distances: &PairwiseDistances<T>,
    memberships: &[usize],
    sequences: &[Sequence<T>],
) -> Result<Vec<usize>, ClusterError> {
    let clusters = super::cluster_count(memberships);
    let mut medoids = Vec::with_capacity(clusters);
    for cluster in 0..clusters {
        let members: Vec<usize> = memberships
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| (c == cluster).then_some(i))
            .collect();
        let medoid = match members.len() {
            0 => return Err(ClusterError::MedoidLogic { cluster }),
            1 => members[0],
            2 => {
                if sequences[members[0]].len() > sequences[members[1]].len() {
                    members[0]
                } else {
                    members[1]
                }
            }
            _ => {
                let mut best = None;
                let mut best_sos = f64::INFINITY;
                for &i in &members {
                    let mut sos = 0.0;
                    for &j in &members {
                        if i == j {
                            continue;
                        }
                        let d = distances.get(i.min(j), i.max(j)).to_f64();
                        sos += d * d;
                    }
                    if sos < best_sos {
                        best_sos = sos;
                        best = Some(i);
                    }
                }
                best.ok_or(ClusterError::MedoidLogic { cluster })?
            }
        };
        log::info!(
            "cluster {cluster}: membership={}, medoid is {}",
            members.len(),
            sequences[medoid].name
        );
        medoids.push(medoid);
    }
    Ok(medoids)
}

fn membership_path(output_prefix: &str) -> PathBuf {
    Path::new(&format!("{output_prefix}.cluster_membership.txt")).to_path_buf()
}

/// Write `{prefix}.cluster_membership.txt`: a `#` header noting the cut
/// threshold, then one `name<TAB>cluster_id<TAB>medoid_name` row per
/// sequence.
pub fn write_membership<T: Sample>(
    output_prefix: &str,
    cdist: f64,
    sequences: &[Sequence<T>],
    memberships: &[usize],
    medoids: &[usize],
) -> Result<(), ClusterError> {
    let path = membership_path(output_prefix);
    let file = File::create(&path).map_err(|source| ClusterError::WriteMembership {
        path: path.clone(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        writeln!(out, "## cluster distance threshold was {cdist}")?;
        for (seq, &cluster) in sequences.iter().zip(memberships) {
            writeln!(
                out,
                "{}\t{}\t{}",
                seq.name, cluster, sequences[medoids[cluster]].name
            )?;
        }
        out.flush()
    };
    write().map_err(|source| ClusterError::WriteMembership { path, source })
}

/// Read memberships and medoid indices back for a `ConsensusOnly` run.
/// The file must cover every current sequence by name; violations are
/// configuration errors.
pub fn read_membership<T: Sample>(
    output_prefix: &str,
    sequences: &[Sequence<T>],
) -> Result<(Vec<usize>, Vec<usize>), ClusterError> {
    let path = membership_path(output_prefix);
    let file = File::open(&path).map_err(|source| ClusterError::ReadMembership {
        path: path.clone(),
        source,
    })?;

    let index_by_name: HashMap<&str, usize> = sequences
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut cluster_by_name: HashMap<String, (usize, String)> = HashMap::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| ClusterError::ReadMembership {
            path: path.clone(),
            source,
        })?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (name, cluster, medoid_name) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(n), Some(c), Some(m), None) => (n, c, m),
                _ => {
                    return Err(ClusterError::MembershipFormat {
                        path: path.clone(),
                        line: line_no + 1,
                    })
                }
            };
        let cluster: usize = cluster.parse().map_err(|_| ClusterError::MembershipFormat {
            path: path.clone(),
            line: line_no + 1,
        })?;
        cluster_by_name.insert(name.to_string(), (cluster, medoid_name.to_string()));
    }

    let mut memberships = Vec::with_capacity(sequences.len());
    let mut medoid_names: HashMap<usize, String> = HashMap::new();
    for seq in sequences {
        let Some((cluster, medoid_name)) = cluster_by_name.get(&seq.name) else {
            return Err(ClusterError::MembershipMissing {
                path: path.clone(),
                name: seq.name.clone(),
            });
        };
        memberships.push(*cluster);
        medoid_names.insert(*cluster, medoid_name.clone());
    }

    let clusters = super::cluster_count(&memberships);
    let mut medoids = Vec::with_capacity(clusters);
    for cluster in 0..clusters {
        let name = medoid_names
            .get(&cluster)
            .ok_or(ClusterError::MedoidLogic { cluster })?;
        let &index = index_by_name.get(name.as_str()).ok_or_else(|| {
            ClusterError::MembershipMissing {
                path: path.clone(),
                name: name.clone(),
            }
        })?;
        medoids.push(index);
    }
    Ok((memberships, medoids))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(lengths: &[usize]) -> Vec<Sequence<f64>> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| Sequence::new(format!("s{i}"), vec![0.0; len]))
            .collect()
    }

    fn distances(n: usize, f: impl Fn(usize, usize) -> f64) -> PairwiseDistances<f64> {
        let mut d = PairwiseDistances::new(n).expect("alloc");
        for i in 0..n.saturating_sub(1) {
            let row: Vec<f64> = (i + 1..n).map(|j| f(i, j)).collect();
            d.set_row(i, &row);
        }
        d
    }

    #[test]
    fn three_member_cluster_uses_min_sum_of_squares() {
        // s1 is closest to both others.
        let d = distances(3, |i, j| match (i, j) {
            (0, 1) => 1.0,
            (1, 2) => 1.0,
            (0, 2) => 3.0,
            _ => unreachable!(),
        });
        let medoids =
            select_medoids(&d, &[0, 0, 0], &seqs(&[3, 3, 3])).expect("medoids");
        assert_eq!(medoids, vec![1]);
    }

    #[test]
    fn two_member_cluster_takes_the_longer_sequence() {
        let d = distances(2, |_, _| 2.0);
        let medoids = select_medoids(&d, &[0, 0], &seqs(&[3, 5])).expect("medoids");
        assert_eq!(medoids, vec![1]);
        let medoids = select_medoids(&d, &[0, 0], &seqs(&[9, 5])).expect("medoids");
        assert_eq!(medoids, vec![0]);
    }

    #[test]
    fn singleton_is_its_own_medoid() {
        let d = distances(3, |_, _| 1.0);
        let medoids =
            select_medoids(&d, &[0, 0, 1], &seqs(&[3, 4, 2])).expect("medoids");
        assert_eq!(medoids[1], 2);
    }

    #[test]
    fn membership_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("mt").to_string_lossy().into_owned();
        let sequences = seqs(&[2, 3, 4, 5]);
        let memberships = vec![0, 0, 1, 1];
        let medoids = vec![1, 3];
        write_membership(&prefix, 0.4, &sequences, &memberships, &medoids).expect("write");

        let text = std::fs::read_to_string(format!("{prefix}.cluster_membership.txt"))
            .expect("read back");
        assert!(text.starts_with("## cluster distance threshold was 0.4"));
        assert!(text.contains("s2\t1\ts3"));

        let (m2, med2) = read_membership(&prefix, &sequences).expect("read");
        assert_eq!(m2, memberships);
        assert_eq!(med2, medoids);
    }

    #[test]
    fn malformed_membership_line_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("bad").to_string_lossy().into_owned();
        std::fs::write(
            format!("{prefix}.cluster_membership.txt"),
            "## header\ns0\tnot-a-number\ts0\n",
        )
        .expect("write fixture");
        let err = read_membership(&prefix, &seqs(&[2])).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn missing_sequence_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("miss").to_string_lossy().into_owned();
        std::fs::write(
            format!("{prefix}.cluster_membership.txt"),
            "s0\t0\ts0\n",
        )
        .expect("write fixture");
        let err = read_membership(&prefix, &seqs(&[2, 3])).unwrap_err();
        assert!(err.to_string().contains("does not cover"));
    }
}
