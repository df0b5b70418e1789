//! Result files: truncate-with-header on job start, one appended line per
//! checked value. Files open and close within a single command or frame
//! handling; failures fail the affected job, never the process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::checker::Checker;

#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    #[error("cannot open results file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write results file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Checker(#[from] crate::checker::CheckerError),
}

/// Create or truncate the job's result file and write its header.
pub fn create_results_file(
    dir: &Path,
    filename: &str,
    checker_name: &str,
    start: u32,
    end: u32,
) -> Result<(), ResultsError> {
    let path = dir.join(filename);
    let file = File::create(&path).map_err(|source| ResultsError::Open {
        path: path.clone(),
        source,
    })?;
    let mut w = BufWriter::new(file);
    write!(w, "Conjecture results: {checker_name}\n\nRange: {start} -> {end}\n\n")
        .and_then(|()| w.flush())
        .map_err(|source| ResultsError::Write { path, source })
}

/// Check every value in [start, end] and append one line per value.
pub fn run_range(
    checker: &dyn Checker,
    dir: &Path,
    filename: &str,
    start: u32,
    end: u32,
) -> Result<(), ResultsError> {
    if end < start {
        return Ok(());
    }
    let path = dir.join(filename);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| ResultsError::Open {
            path: path.clone(),
            source,
        })?;
    let mut w = BufWriter::new(file);
    for value in start..=end {
        let line = checker.check(value)?;
        writeln!(w, "{line}").map_err(|source| ResultsError::Write {
            path: path.clone(),
            source,
        })?;
    }
    w.flush().map_err(|source| ResultsError::Write { path, source })
}
