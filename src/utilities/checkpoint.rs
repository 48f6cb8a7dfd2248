//! Convergence checkpoints.
//!
//! Two levels: the per-cluster evolving centroid (overwritten after every
//! accepted refinement round, deleted on convergence) and the averages
//! file `{prefix}.avg.txt` (append-only, one row per converged cluster,
//! flushed so an interrupted run resumes at the first missing cluster).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint: Cannot write averages file {}: {source}", .path.display())]
    WriteAverages {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint: Cannot read averages file {}: {source}", .path.display())]
    ReadAverages {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn evolving_centroid_path(output_prefix: &str, cluster: usize) -> PathBuf {
    PathBuf::from(format!("{output_prefix}.{cluster}.evolving_centroid.txt"))
}

/// Overwrite the evolving-centroid checkpoint: space-separated values on
/// one line, flushed before close.
pub fn write_evolving_centroid<T: Sample>(path: &Path, centroid: &[T]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for (i, v) in centroid.iter().enumerate() {
        if i > 0 {
            out.write_all(b" ")?;
        }
        write!(out, "{v}")?;
    }
    out.write_all(b"\n")?;
    out.flush()
}

/// Read a checkpoint back. Missing files mean "no checkpoint"; corrupt or
/// length-mismatched files are ignored with a warning so the round
/// restarts from the medoid.
pub fn read_evolving_centroid<T: Sample>(path: &Path, expected_len: usize) -> Option<Vec<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return None,
    };
    let mut values = Vec::with_capacity(expected_len);
    for token in text.split_whitespace() {
        match token.parse::<T>() {
            Ok(v) => values.push(v),
            Err(_) => {
                log::warn!(
                    "ignoring corrupt centroid checkpoint {} (bad value {token:?})",
                    path.display()
                );
                return None;
            }
        }
    }
    if values.len() != expected_len {
        log::warn!(
            "ignoring centroid checkpoint {} with {} values (expected {expected_len})",
            path.display(),
            values.len()
        );
        return None;
    }
    Some(values)
}

pub fn delete_evolving_centroid(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove centroid checkpoint {}: {err}", path.display());
        }
    }
}

pub fn averages_path(output_prefix: &str) -> PathBuf {
    PathBuf::from(format!("{output_prefix}.avg.txt"))
}

/// Number of cluster rows already present in `{prefix}.avg.txt`; zero if
/// the file does not exist. Refinement resumes at this cluster index.
pub fn completed_average_rows(output_prefix: &str) -> Result<usize, CheckpointError> {
    let path = averages_path(output_prefix);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(CheckpointError::ReadAverages { path, source }),
    };
    let mut rows = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| CheckpointError::ReadAverages {
            path: path.clone(),
            source,
        })?;
        if !line.trim().is_empty() {
            rows += 1;
        }
    }
    Ok(rows)
}

/// Append-mode writer for the averages file. Each row is flushed
/// immediately so it doubles as the cluster-level checkpoint.
pub struct AveragesWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl AveragesWriter {
    pub fn open_append(output_prefix: &str) -> Result<Self, CheckpointError> {
        let path = averages_path(output_prefix);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CheckpointError::WriteAverages {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
        })
    }

    /// Write `medoid_name<TAB>v0<TAB>v1...` and flush.
    pub fn write_row<T: Sample>(
        &mut self,
        medoid_name: &str,
        values: &[T],
    ) -> Result<(), CheckpointError> {
        let mut write = || -> std::io::Result<()> {
            self.out.write_all(medoid_name.as_bytes())?;
            for v in values {
                write!(self.out, "\t{v}")?;
            }
            self.out.write_all(b"\n")?;
            self.out.flush()
        };
        write().map_err(|source| CheckpointError::WriteAverages {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evolving_centroid_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.evolving_centroid.txt");
        let centroid = vec![1.5f64, -2.25, 0.0, 1e-9, 123456.789];
        write_evolving_centroid(&path, &centroid).expect("write");
        let back = read_evolving_centroid::<f64>(&path, centroid.len()).expect("read");
        assert_eq!(back, centroid, "text round-trip must be exact for f64");
    }

    #[test]
    fn corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "1.0 stuff 3.0\n").expect("fixture");
        assert!(read_evolving_centroid::<f64>(&path, 3).is_none());
    }

    #[test]
    fn length_mismatch_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.txt");
        std::fs::write(&path, "1.0 2.0\n").expect("fixture");
        assert!(read_evolving_centroid::<f64>(&path, 3).is_none());
    }

    #[test]
    fn missing_checkpoint_reads_as_none_and_delete_is_silent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.txt");
        assert!(read_evolving_centroid::<f64>(&path, 3).is_none());
        delete_evolving_centroid(&path);
    }

    #[test]
    fn averages_append_and_resume_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("run").to_string_lossy().into_owned();
        assert_eq!(completed_average_rows(&prefix).expect("count"), 0);

        let mut w = AveragesWriter::open_append(&prefix).expect("open");
        w.write_row("m0", &[1.0f64, 2.0]).expect("row 0");
        w.write_row("m1", &[3.0f64]).expect("row 1");
        drop(w);
        assert_eq!(completed_average_rows(&prefix).expect("count"), 2);

        // Appending after a resume keeps earlier rows.
        let mut w = AveragesWriter::open_append(&prefix).expect("reopen");
        w.write_row("m2", &[4.0f64]).expect("row 2");
        drop(w);
        let text = std::fs::read_to_string(format!("{prefix}.avg.txt")).expect("read");
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("m0\t1\t2\n"));
    }
}
