/// Controller status snapshots, serialized to JSON on each transition so an
/// operator can inspect a running (or finished) supervisor.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Control loop phases written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Running,
    Evaluating,
    Reducing,
    Stopping,
    Exited,
    Failed,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: Phase,
    pub child_pid: Option<u32>,
    pub hyperparameter: Option<f64>,
    pub resume: bool,
    pub reductions: u32,
    pub max_reductions: u32,
    pub epochs: usize,
    pub best: Option<f64>,
    pub metric_column: Option<String>,
    pub process_start: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_update: DateTime<Utc>,
}

/// Destination of status snapshots. Readers only ever see whole documents.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling scratch file, unique per controller pid.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "status".into(), |n| n.to_string_lossy());
        let staged = format!(".{name}.{}.partial", std::process::id());
        match self.path.parent() {
            Some(dir) => dir.join(staged),
            None => PathBuf::from(staged),
        }
    }

    /// Replace the file contents with `data` via a staged write and rename.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let mut body = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
        body.push(b'\n');

        let staged = self.staging_path();
        std::fs::write(&staged, &body)
            .and_then(|()| std::fs::rename(&staged, &self.path))
            .map_err(|source| {
                let _ = std::fs::remove_file(&staged);
                StatusError::Persist {
                    path: self.path.clone(),
                    source,
                }
            })
    }
}

/// Accumulates what the controller knows about the current run.
pub struct StatusTracker {
    file: Option<StatusFile>,
    pid: u32,
    child_pid: Option<u32>,
    hyperparameter: Option<f64>,
    resume: bool,
    reductions: u32,
    max_reductions: u32,
    epochs: usize,
    best: Option<f64>,
    metric_column: Option<String>,
    process_start: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
}

impl StatusTracker {
    /// Create a new tracker writing to `status_path`.
    pub fn new(status_path: PathBuf, max_reductions: u32) -> Self {
        Self::build(Some(StatusFile::new(status_path)), max_reductions)
    }

    /// A tracker that records state but never touches the filesystem.
    pub fn disabled(max_reductions: u32) -> Self {
        Self::build(None, max_reductions)
    }

    fn build(file: Option<StatusFile>, max_reductions: u32) -> Self {
        Self {
            file,
            pid: std::process::id(),
            child_pid: None,
            hyperparameter: None,
            resume: false,
            reductions: 0,
            max_reductions,
            epochs: 0,
            best: None,
            metric_column: None,
            process_start: None,
            exit_code: None,
        }
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self, state: Phase) -> StatusData {
        StatusData {
            pid: self.pid,
            state,
            child_pid: self.child_pid,
            hyperparameter: self.hyperparameter,
            resume: self.resume,
            reductions: self.reductions,
            max_reductions: self.max_reductions,
            epochs: self.epochs,
            best: self.best,
            metric_column: self.metric_column.clone(),
            process_start: self.process_start,
            exit_code: self.exit_code,
            last_update: Utc::now(),
        }
    }

    /// Persist a snapshot in `state`. Failures are logged, never fatal.
    pub fn update(&self, state: Phase) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = file.write(&self.snapshot(state)) {
            tracing::warn!(error = %e, path = %file.path().display(), "failed to write status file");
        }
    }

    /// Record a freshly started training process.
    pub fn set_process(&mut self, child_pid: Option<u32>, hyperparameter: Option<f64>, resume: bool) {
        self.child_pid = child_pid;
        self.hyperparameter = hyperparameter;
        self.resume = resume;
        self.process_start = Some(Utc::now());
        self.exit_code = None;
    }

    /// Record that the training process has been reaped.
    pub fn set_exited(&mut self, code: i32) {
        self.child_pid = None;
        self.exit_code = Some(code);
    }

    pub fn set_reductions(&mut self, reductions: u32) {
        self.reductions = reductions;
    }

    /// Record the latest plateau check inputs.
    pub fn set_progress(&mut self, epochs: usize, best: Option<f64>, column: &str) {
        self.epochs = epochs;
        self.best = best;
        self.metric_column = Some(column.to_string());
    }
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode status snapshot: {e}"),
            StatusError::Persist { path, source } => {
                write!(f, "cannot persist status to {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Persist { source, .. } => Some(source),
        }
    }
}
