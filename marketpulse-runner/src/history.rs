//! Run history: JSONL append-only log of run reports.
//!
//! One report per line. Malformed lines are skipped on read so a partial write
//! never hides the rest of the history.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::report::RunReport;

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one report, creating the file and its parent directories on demand.
    pub fn append(&self, report: &RunReport) -> io::Result<()> {
        let json = serde_json::to_string(report)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()
    }

    /// Every readable report, oldest first.
    pub fn read_all(&self) -> io::Result<Vec<RunReport>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut reports = Vec::new();
        for (idx, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunReport>(&line) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping malformed history line"
                ),
            }
        }
        Ok(reports)
    }

    /// The last `limit` reports, newest first.
    pub fn read_recent(&self, limit: usize) -> io::Result<Vec<RunReport>> {
        let mut all = self.read_all()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }
}
