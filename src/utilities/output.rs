//! Writers for the per-member alignment path files and the prefix-chop
//! report.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::step::StepCode;
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output: Cannot write DTW path file {}: {source}", .path.display())]
    WritePath {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("output: Cannot write prefix chop file {}: {source}", .path.display())]
    WriteChop {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One `{prefix}.path{member}.txt` alignment file. The first line is the
/// member name; each subsequent line is
/// `centroid_idx<TAB>centroid_val<TAB>member_idx<TAB>member_val<TAB>STEP`,
/// emitted in backtrace order (alignment end first).
pub struct PathFileWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl PathFileWriter {
    pub fn create(
        output_prefix: &str,
        member_index: usize,
        member_name: &str,
    ) -> Result<Self, OutputError> {
        let path = PathBuf::from(format!("{output_prefix}.path{member_index}.txt"));
        let file = File::create(&path).map_err(|source| OutputError::WritePath {
            path: path.clone(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{member_name}").map_err(|source| OutputError::WritePath {
            path: path.clone(),
            source,
        })?;
        Ok(Self { out, path })
    }

    pub fn step<T: Sample>(
        &mut self,
        centroid_idx: usize,
        centroid_val: T,
        member_idx: usize,
        member_val: T,
        code: StepCode,
    ) -> Result<(), OutputError> {
        writeln!(
            self.out,
            "{centroid_idx}\t{centroid_val}\t{member_idx}\t{member_val}\t{}",
            code.label()
        )
        .map_err(|source| OutputError::WritePath {
            path: self.path.clone(),
            source,
        })
    }

    pub fn finish(mut self) -> Result<(), OutputError> {
        self.out.flush().map_err(|source| OutputError::WritePath {
            path: self.path.clone(),
            source,
        })
    }
}

/// Writer for `{prefix}.prefix_chop.txt`:
/// `name<TAB>chop_pos<TAB>orig_length<TAB>hist[0]...hist[Lp-1]`.
pub struct ChopReportWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl ChopReportWriter {
    pub fn create(output_prefix: &str) -> Result<Self, OutputError> {
        let path = PathBuf::from(format!("{output_prefix}.prefix_chop.txt"));
        let file = File::create(&path).map_err(|source| OutputError::WriteChop {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
        })
    }

    pub fn row(
        &mut self,
        name: &str,
        chop_pos: usize,
        orig_length: usize,
        histogram: &[u32],
    ) -> Result<(), OutputError> {
        let mut write = || -> std::io::Result<()> {
            write!(self.out, "{name}\t{chop_pos}\t{orig_length}")?;
            for h in histogram {
                write!(self.out, "\t{h}")?;
            }
            self.out.write_all(b"\n")
        };
        write().map_err(|source| OutputError::WriteChop {
            path: self.path.clone(),
            source,
        })
    }

    pub fn finish(mut self) -> Result<(), OutputError> {
        self.out.flush().map_err(|source| OutputError::WriteChop {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_file_has_name_header_and_step_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("run.0").to_string_lossy().into_owned();
        let mut w = PathFileWriter::create(&prefix, 2, "member-two").expect("create");
        w.step(4usize, 1.5f64, 5usize, 1.25f64, StepCode::Diagonal)
            .expect("step");
        w.step(3usize, 1.0f64, 5usize, 1.25f64, StepCode::Right)
            .expect("step");
        w.finish().expect("finish");

        let text = std::fs::read_to_string(format!("{prefix}.path2.txt")).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "member-two");
        assert_eq!(lines[1], "4\t1.5\t5\t1.25\tDIAG");
        assert_eq!(lines[2], "3\t1\t5\t1.25\tRIGHT");
    }

    #[test]
    fn chop_report_rows_carry_histogram() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("chop").to_string_lossy().into_owned();
        let mut w = ChopReportWriter::create(&prefix).expect("create");
        w.row("seq-a", 2, 7, &[1, 1, 1]).expect("row");
        w.finish().expect("finish");
        let text = std::fs::read_to_string(format!("{prefix}.prefix_chop.txt")).expect("read");
        assert_eq!(text, "seq-a\t2\t7\t1\t1\t1\n");
    }
}
