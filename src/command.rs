/// Training command template and the per-launch run spec derived from it.
use crate::config::TrainingConfig;
use std::sync::Arc;

/// The parts of the training command that never change during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    pub command: String,
    pub args: Vec<String>,
    pub shell: bool,
    pub hyperparameter_arg: String,
    pub resume_arg: String,
}

impl CommandTemplate {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            shell: config.shell,
            hyperparameter_arg: config.hyperparameter_arg.clone(),
            resume_arg: config.resume_arg.clone(),
        }
    }
}

/// What to launch: the template plus the current hyperparameter and resume flag.
///
/// Restarts derive a new spec with [`TrainingRunSpec::reduced`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRunSpec {
    template: Arc<CommandTemplate>,
    hyperparameter: Option<f64>,
    resume: bool,
}

/// A fully rendered command: program plus argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RenderedCommand {
    /// Single-line form for logs and for shell launch.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl TrainingRunSpec {
    /// The spec for the very first launch.
    pub fn initial(template: CommandTemplate, hyperparameter: Option<f64>) -> Self {
        Self {
            template: Arc::new(template),
            hyperparameter,
            resume: false,
        }
    }

    pub fn hyperparameter(&self) -> Option<f64> {
        self.hyperparameter
    }

    pub fn resume(&self) -> bool {
        self.resume
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// The spec for the next launch after a plateau.
    ///
    /// Without a known value, `default_value` is used as the starting point.
    pub fn reduced(&self, factor: f64, default_value: f64) -> Self {
        let current = self.hyperparameter.unwrap_or(default_value);
        Self {
            template: Arc::clone(&self.template),
            hyperparameter: Some(current * factor),
            resume: true,
        }
    }

    /// Program and argv with the hyperparameter and resume arguments appended.
    pub fn render(&self) -> RenderedCommand {
        let mut args = self.template.args.clone();
        if let Some(value) = self.hyperparameter {
            args.push(
                self.template
                    .hyperparameter_arg
                    .replace("{value}", &value.to_string()),
            );
        }
        if self.resume && !self.template.resume_arg.is_empty() {
            args.push(self.template.resume_arg.clone());
        }
        RenderedCommand {
            program: self.template.command.clone(),
            args,
        }
    }
}
