use crate::feature::{EdgeId, Feature};
use crate::storage::StorageError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the coverage report inside the coverage directory.
pub const COVERAGE_REPORT_FILE: &str = "coverage.json";

/// The corpus-affecting event a progress line reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    New,
    Reduce,
    Pulse,
    Done,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgressEvent::New => "NEW",
            ProgressEvent::Reduce => "REDUCE",
            ProgressEvent::Pulse => "PULSE",
            ProgressEvent::Done => "DONE",
        };
        // pad so the columns after the event name line up
        f.pad(name)
    }
}

/// Snapshot of session counters for one progress line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressStats {
    pub runs: u64,
    pub features: usize,
    /// Features gained since the seed corpus was loaded.
    pub new_features: usize,
    pub corpus_len: usize,
    pub corpus_bytes: usize,
    pub len: usize,
    pub max_len: usize,
    pub elapsed: Duration,
}

/// Renders a byte count as `b`, `kb` or `mb`, switching units at 10 KiB and 10 MiB.
pub fn format_bytes(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;
    if bytes < 10 * KIB {
        format!("{bytes}b")
    } else if bytes < 10 * MIB {
        format!("{}kb", bytes / KIB)
    } else {
        format!("{}mb", bytes / MIB)
    }
}

/// Formats a progress line, e.g.
/// `NEW    run: 120 (  40/s), ft: 7 (2/s), corp: 3 (12b), len: 5/8, t: 3s`.
pub fn format_progress(event: ProgressEvent, stats: &ProgressStats) -> String {
    let secs = stats.elapsed.as_secs_f64().max(f64::EPSILON);
    format!(
        "{:<6} run: {} ({:4.0}/s), ft: {} ({:.0}/s), corp: {} ({}), len: {}/{}, t: {:.0}s",
        event,
        stats.runs,
        stats.runs as f64 / secs,
        stats.features,
        stats.new_features as f64 / secs,
        stats.corpus_len,
        format_bytes(stats.corpus_bytes),
        stats.len,
        stats.max_len,
        stats.elapsed.as_secs_f64(),
    )
}

/// Coverage data for an external renderer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CoverageReport {
    /// Every feature seen by the session's corpus.
    pub seen_features: BTreeSet<Feature>,
    /// The distinct edges those features were derived from.
    pub covered_edges: BTreeSet<EdgeId>,
    /// All edges the target was instrumented with, if the executor knows them.
    pub instrumented_edges: Option<BTreeSet<EdgeId>>,
}

impl CoverageReport {
    /// Fraction of instrumented edges that were covered, when that is known.
    pub fn edge_coverage(&self) -> Option<f64> {
        let instrumented = self.instrumented_edges.as_ref()?;
        if instrumented.is_empty() {
            return None;
        }
        let hit = instrumented.intersection(&self.covered_edges).count();
        Some(hit as f64 / instrumented.len() as f64)
    }

    /// Writes the report as JSON to `coverage.json` inside `dir`, creating `dir` if needed.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(dir).map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(COVERAGE_REPORT_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        fs::write(&path, json).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
