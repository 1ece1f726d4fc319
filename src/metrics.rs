//! Metric log reading and smoothing.
//!
//! The training process appends one CSV row per epoch. Every read here is an
//! independent snapshot: the file may be missing, empty, or caught mid-write,
//! and none of those are errors.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

/// Everything that is not a letter or digit, for tolerant column matching.
static NON_ALPHANUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Ordered values of one metric column; `None` marks an absent or unparseable entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub column: String,
    pub values: Vec<Option<f64>>,
}

/// A metric series after the trailing moving average.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedSeries {
    pub column: String,
    pub source: PathBuf,
    pub values: Vec<Option<f64>>,
}

impl SmoothedSeries {
    /// Present values in epoch order.
    pub fn present(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().flatten().copied()
    }
}

/// Why a read produced no series yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    Missing,
    Empty,
    NoColumn { available: Vec<String> },
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotReadyReason::Missing => write!(f, "metric log not found"),
            NotReadyReason::Empty => write!(f, "metric log has no data rows"),
            NotReadyReason::NoColumn { available } => {
                write!(f, "no matching column among [{}]", available.join(", "))
            }
        }
    }
}

/// Result of one snapshot read.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricRead {
    Ready(SmoothedSeries),
    NotReady(NotReadyReason),
}

/// The metric log could not be read for a reason other than not existing yet.
#[derive(Debug)]
pub enum ReadError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io { path, source } => {
                write!(f, "failed to read metric log {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io { source, .. } => Some(source),
        }
    }
}

/// Lowercase and strip punctuation so `mAP_50-95` and `map50_95` compare equal.
fn normalize(name: &str) -> String {
    NON_ALPHANUMERIC
        .replace_all(&name.to_lowercase(), "")
        .into_owned()
}

/// Pick the column for `metric`: exact, then normalized equality, then raw
/// substring, then normalized substring. Leftmost column wins within a stage.
pub fn resolve_column(headers: &[String], metric: &str) -> Option<usize> {
    let metric = metric.trim();
    let wanted = normalize(metric);

    if let Some(i) = headers.iter().position(|h| h == metric) {
        return Some(i);
    }
    if !wanted.is_empty() {
        if let Some(i) = headers.iter().position(|h| normalize(h) == wanted) {
            return Some(i);
        }
    }
    if let Some(i) = headers.iter().position(|h| h.contains(metric)) {
        return Some(i);
    }
    if wanted.is_empty() {
        return None;
    }
    headers.iter().position(|h| normalize(h).contains(&wanted))
}

fn split_fields(line: &str) -> Vec<String> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"').trim().to_string())
        .collect()
}

fn parse_value(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse CSV text into the series for `metric`.
///
/// An unterminated final line is an in-progress write and is dropped. Rows
/// with more fields than the header are skipped.
pub fn parse_series(text: &str, metric: &str) -> Result<MetricSeries, NotReadyReason> {
    let mut complete: Vec<&str> = text.split('\n').collect();
    // The piece after the last '\n' is either "" or a partial row.
    complete.pop();

    let mut lines = complete
        .into_iter()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    let headers = match lines.next() {
        Some(header) => split_fields(header),
        None => return Err(NotReadyReason::Empty),
    };

    let column = match resolve_column(&headers, metric) {
        Some(i) => i,
        None => {
            return Err(NotReadyReason::NoColumn {
                available: headers,
            })
        }
    };

    let mut values = Vec::new();
    for (row, line) in lines.enumerate() {
        let fields = split_fields(line);
        if fields.len() > headers.len() {
            tracing::debug!(row, fields = fields.len(), "skipping malformed metric row");
            continue;
        }
        values.push(fields.get(column).and_then(|f| parse_value(f)));
    }

    if values.is_empty() {
        return Err(NotReadyReason::Empty);
    }

    Ok(MetricSeries {
        column: headers[column].clone(),
        values,
    })
}

/// Trailing moving average over present values; no look-ahead.
pub fn smooth(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let present: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
            if present.is_empty() {
                None
            } else {
                Some(present.iter().sum::<f64>() / present.len() as f64)
            }
        })
        .collect()
}

/// Read `path`, select `metric`, and smooth it with `window`.
pub fn read_metric(path: &Path, metric: &str, window: usize) -> Result<MetricRead, ReadError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(MetricRead::NotReady(NotReadyReason::Missing))
        }
        Err(e) => {
            return Err(ReadError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    // Lossy: a write may stop in the middle of a multi-byte sequence.
    let text = String::from_utf8_lossy(&bytes);
    match parse_series(&text, metric) {
        Ok(series) => Ok(MetricRead::Ready(SmoothedSeries {
            values: smooth(&series.values, window),
            column: series.column,
            source: path.to_path_buf(),
        })),
        Err(reason) => Ok(MetricRead::NotReady(reason)),
    }
}

/// Anything the control loop can poll for a smoothed metric series.
pub trait MetricSource {
    fn read(&mut self) -> Result<MetricRead, ReadError>;
}

/// Reads the first existing candidate log.
///
/// Candidates are tried in order. A glob candidate resolves to its most
/// recently modified match.
pub struct CsvMetricSource {
    candidates: Vec<String>,
    metric: String,
    window: usize,
}

impl CsvMetricSource {
    pub fn new(candidates: Vec<String>, metric: impl Into<String>, window: usize) -> Self {
        Self {
            candidates,
            metric: metric.into(),
            window,
        }
    }

    /// The log file to read right now, if any candidate exists.
    pub fn locate(&self) -> Option<PathBuf> {
        self.candidates.iter().find_map(|c| resolve_candidate(c))
    }
}

fn is_pattern(candidate: &str) -> bool {
    candidate.contains(['*', '?', '['])
}

fn resolve_candidate(candidate: &str) -> Option<PathBuf> {
    if !is_pattern(candidate) {
        let path = PathBuf::from(candidate);
        return path.is_file().then_some(path);
    }

    let matches = match glob::glob(candidate) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(pattern = candidate, error = %e, "invalid metric log pattern");
            return None;
        }
    };

    matches
        .flatten()
        .filter(|p| p.is_file())
        .map(|p| {
            let modified = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, p)| p)
}

impl MetricSource for CsvMetricSource {
    fn read(&mut self) -> Result<MetricRead, ReadError> {
        match self.locate() {
            Some(path) => read_metric(&path, &self.metric, self.window),
            None => Ok(MetricRead::NotReady(NotReadyReason::Missing)),
        }
    }
}
