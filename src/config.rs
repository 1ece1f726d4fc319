use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from plateau.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub training: TrainingConfig,
    pub metrics: MetricsConfig,
    pub plateau: PlateauConfig,
    pub reduction: ReductionConfig,
    pub shutdown: ShutdownConfig,
    pub status: StatusConfig,
}

/// How to launch the monitored training process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Run the rendered command line through the platform shell.
    pub shell: bool,
    /// Appended whenever a hyperparameter value is known; `{value}` is replaced.
    pub hyperparameter_arg: String,
    /// Appended on every restart.
    pub resume_arg: String,
    pub initial_value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Candidate metric logs in order of preference. Glob patterns allowed.
    pub files: Vec<String>,
    pub metric: String,
    pub smooth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub min_delta: f64,
    pub patience: usize,
    pub min_epochs: usize,
    pub check_interval_secs: u64,
    /// Present epochs required after a restart before another plateau can
    /// trigger. 0 evaluates immediately.
    pub restart_cooldown_epochs: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub factor: f64,
    pub max_reductions: u32,
    /// Substituted for the hyperparameter on the first reduction when no
    /// initial value was configured.
    pub default_value: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_file: PathBuf,
    pub graceful_signal: String,
    /// When false, stopping always kills the process group outright.
    pub graceful: bool,
    /// 0 waits forever.
    pub grace_timeout_secs: u64,
    pub force_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub file: PathBuf,
    pub lock_file: PathBuf,
}

// --- Default implementations ---

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            shell: false,
            hyperparameter_arg: "lr0={value}".to_string(),
            resume_arg: "resume=True".to_string(),
            initial_value: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            files: vec![
                "runs/detect/train/metrics.csv".to_string(),
                "runs/detect/train/results.csv".to_string(),
            ],
            metric: "fitness".to_string(),
            smooth: 3,
        }
    }
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            min_delta: 0.0005,
            patience: 3,
            min_epochs: 10,
            check_interval_secs: 30,
            restart_cooldown_epochs: 0,
        }
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            factor: 0.2,
            max_reductions: 1,
            default_value: 0.01,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("STOP"),
            graceful_signal: "SIGTERM".to_string(),
            graceful: true,
            grace_timeout_secs: 300,
            force_window_secs: 3,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("plateau.status"),
            lock_file: PathBuf::from(".plateau.lock"),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// One entry per failed check.
    Invalid(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(problems) => {
                write!(f, "invalid configuration: {}", problems.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl SupervisorConfig {
    /// Load config from `path`. A missing file yields all defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check every setting once, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.training.command.trim().is_empty() {
            problems.push("training.command must be set".to_string());
        }
        if !self.training.hyperparameter_arg.contains("{value}") {
            problems.push("training.hyperparameter_arg must contain {value}".to_string());
        }
        if let Some(v) = self.training.initial_value {
            if !(v.is_finite() && v > 0.0) {
                problems.push(format!("training.initial_value must be > 0 (got {v})"));
            }
        }

        if self.metrics.metric.trim().is_empty() {
            problems.push("metrics.metric must be set".to_string());
        }
        if self.metrics.files.is_empty() {
            problems.push("metrics.files must list at least one metric log".to_string());
        }
        for candidate in &self.metrics.files {
            if let Err(e) = glob::Pattern::new(candidate) {
                problems.push(format!("metrics.files entry '{candidate}' is not a valid pattern: {e}"));
            }
        }
        if self.metrics.smooth == 0 {
            problems.push("metrics.smooth must be >= 1".to_string());
        }

        if !(self.plateau.min_delta.is_finite() && self.plateau.min_delta >= 0.0) {
            problems.push(format!(
                "plateau.min_delta must be >= 0 (got {})",
                self.plateau.min_delta
            ));
        }
        if self.plateau.patience == 0 {
            problems.push("plateau.patience must be >= 1".to_string());
        }
        if self.plateau.check_interval_secs == 0 {
            problems.push("plateau.check_interval_secs must be >= 1".to_string());
        }

        let factor = self.reduction.factor;
        if !(factor > 0.0 && factor < 1.0) {
            problems.push(format!("reduction.factor must be in (0, 1) (got {factor})"));
        }
        if !(self.reduction.default_value.is_finite() && self.reduction.default_value > 0.0) {
            problems.push(format!(
                "reduction.default_value must be > 0 (got {})",
                self.reduction.default_value
            ));
        }

        #[cfg(unix)]
        if self.shutdown.graceful {
            if let Err(e) = self.shutdown.graceful_signal.parse::<nix::sys::signal::Signal>() {
                problems.push(format!(
                    "shutdown.graceful_signal '{}' is not a signal name: {e}",
                    self.shutdown.graceful_signal
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.training.command = "yolo".to_string();
        config
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.metrics.metric, "fitness");
        assert_eq!(config.metrics.smooth, 3);
        assert_eq!(config.plateau.patience, 3);
        assert_eq!(config.plateau.min_epochs, 10);
        assert_eq!(config.plateau.check_interval_secs, 30);
        assert_eq!(config.reduction.factor, 0.2);
        assert_eq!(config.reduction.max_reductions, 1);
        assert_eq!(config.reduction.default_value, 0.01);
        assert!(config.training.initial_value.is_none());
    }

    #[test]
    fn test_default_config_requires_command() {
        let err = SupervisorConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("training.command"));
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let toml = r#"
[training]
command = "yolo"
args = ["train", "data=data.yaml"]
initial_value = 0.02

[plateau]
patience = 5
"#;
        let config = SupervisorConfig::parse(Path::new("plateau.toml"), toml).unwrap();
        assert_eq!(config.training.command, "yolo");
        assert_eq!(config.training.args, vec!["train", "data=data.yaml"]);
        assert_eq!(config.training.initial_value, Some(0.02));
        assert_eq!(config.plateau.patience, 5);
        assert_eq!(config.plateau.min_epochs, 10);
        assert_eq!(config.training.resume_arg, "resume=True");
    }

    #[test]
    fn test_parse_error_reports_path() {
        let err = SupervisorConfig::parse(Path::new("bad.toml"), "[plateau\npatience = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.metrics.metric, "fitness");
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plateau.toml");
        std::fs::write(&path, "[reduction]\nfactor = 0.5\nmax_reductions = 3\n").unwrap();
        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.reduction.factor, 0.5);
        assert_eq!(config.reduction.max_reductions, 3);
    }

    #[test]
    fn test_factor_must_be_strictly_between_zero_and_one() {
        for factor in [0.0, 1.0, 1.5, -0.2, f64::NAN] {
            let mut config = valid();
            config.reduction.factor = factor;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("reduction.factor"), "factor {factor}");
        }
    }

    #[test]
    fn test_zero_patience_and_smooth_rejected() {
        let mut config = valid();
        config.plateau.patience = 0;
        config.metrics.smooth = 0;
        match config.validate().unwrap_err() {
            ConfigError::Invalid(problems) => {
                assert_eq!(problems.len(), 2);
                assert!(problems.iter().any(|p| p.contains("patience")));
                assert!(problems.iter().any(|p| p.contains("smooth")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hyperparameter_arg_needs_placeholder() {
        let mut config = valid();
        config.training.hyperparameter_arg = "lr0=0.1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let mut config = valid();
        config.metrics.files = vec!["runs/[unclosed/results.csv".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a valid pattern"));
    }

    #[test]
    fn test_negative_initial_value_rejected() {
        let mut config = valid();
        config.training.initial_value = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_signal_rejected() {
        let mut config = valid();
        config.shutdown.graceful_signal = "SIGNOPE".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("graceful_signal"));

        config.shutdown.graceful_signal = "SIGINT".to_string();
        config.validate().unwrap();
    }
}
