//! The supervising control loop.
//!
//! Polls the training process on a fixed interval, evaluates the metric log
//! for a plateau, and on a plateau either restarts training with a reduced
//! hyperparameter or, once the reduction budget is spent, stops it.
//!
//! ```text
//! Running ──interval──▶ Evaluating ──no plateau / not ready──▶ Running
//!    │                      │ plateau, budget left ──▶ Reducing ──restart──▶ Running
//!    │                      │ plateau, budget spent ──▶ Stopping ──▶ Exited
//!    └─ process exited ──▶ Exited          any ─ interrupt ──▶ Stopping
//! ```

use crate::budget::{ReductionBudget, ReductionDecision};
use crate::command::TrainingRunSpec;
use crate::config::SupervisorConfig;
use crate::metrics::{MetricRead, MetricSource, ReadError};
use crate::plateau;
use crate::signals::{ShutdownLevel, ShutdownListener};
use crate::status::{Phase, StatusTracker};
use crate::supervisor::{LaunchError, ProcessStatus, ProcessSupervisor};
use std::time::Duration;

/// Process exit status when the controller itself fails.
pub const EXIT_FAILED: i32 = 2;
/// Process exit status after an operator interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Loop parameters, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub check_interval: Duration,
    pub min_epochs: usize,
    pub patience: usize,
    pub min_delta: f64,
    /// Present epochs that must accumulate after a restart before the next
    /// plateau check can trigger.
    pub restart_cooldown_epochs: usize,
    pub factor: f64,
    pub default_value: f64,
    /// `None` waits for a gracefully stopped process indefinitely.
    pub grace_timeout: Option<Duration>,
}

impl LoopSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.plateau.check_interval_secs),
            min_epochs: config.plateau.min_epochs,
            patience: config.plateau.patience,
            min_delta: config.plateau.min_delta,
            restart_cooldown_epochs: config.plateau.restart_cooldown_epochs,
            factor: config.reduction.factor,
            default_value: config.reduction.default_value,
            grace_timeout: match config.shutdown.grace_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Why the loop stopped the training process (or saw it stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own.
    Completed,
    /// Plateau with no reductions left.
    BudgetExhausted,
    /// Operator asked the controller to stop.
    Interrupted,
}

/// Unrecoverable conditions.
#[derive(Debug)]
pub enum ControlError {
    Launch(LaunchError),
    Metrics(ReadError),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Launch(e) => write!(f, "{e}"),
            ControlError::Metrics(e) => write!(f, "metric source failed: {e}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Launch(e) => Some(e),
            ControlError::Metrics(e) => Some(e),
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    Exited { reason: ExitReason, code: i32 },
    Failed(ControlError),
}

impl Outcome {
    /// Exit status for the controller process.
    pub fn exit_status(&self) -> i32 {
        match self {
            Outcome::Exited {
                reason: ExitReason::Completed,
                code,
            } => *code,
            Outcome::Exited {
                reason: ExitReason::BudgetExhausted,
                ..
            } => 0,
            Outcome::Exited {
                reason: ExitReason::Interrupted,
                ..
            } => EXIT_INTERRUPTED,
            Outcome::Failed(_) => EXIT_FAILED,
        }
    }
}

#[derive(Debug)]
enum LoopState {
    Running,
    Evaluating,
    Reducing,
    Stopping(ExitReason),
    Exited { reason: ExitReason, code: i32 },
    Failed(ControlError),
}

impl LoopState {
    fn phase(&self) -> Phase {
        match self {
            LoopState::Running => Phase::Running,
            LoopState::Evaluating => Phase::Evaluating,
            LoopState::Reducing => Phase::Reducing,
            LoopState::Stopping(_) => Phase::Stopping,
            LoopState::Exited { .. } => Phase::Exited,
            LoopState::Failed(_) => Phase::Failed,
        }
    }
}

enum Restart<P> {
    Started(P),
    Interrupted(i32),
}

/// Controller state threaded through every iteration.
pub struct ControlLoop<M, S> {
    settings: LoopSettings,
    metrics: M,
    supervisor: S,
    spec: TrainingRunSpec,
    budget: ReductionBudget,
    status: StatusTracker,
    /// Present epochs seen at the last restart.
    epochs_at_restart: Option<usize>,
    #[cfg(test)]
    phases: Vec<Phase>,
}

impl<M: MetricSource, S: ProcessSupervisor> ControlLoop<M, S> {
    pub fn new(
        settings: LoopSettings,
        metrics: M,
        supervisor: S,
        spec: TrainingRunSpec,
        budget: ReductionBudget,
        status: StatusTracker,
    ) -> Self {
        Self {
            settings,
            metrics,
            supervisor,
            spec,
            budget,
            status,
            epochs_at_restart: None,
            #[cfg(test)]
            phases: Vec::new(),
        }
    }

    /// The spec of the most recent launch.
    pub fn spec(&self) -> &TrainingRunSpec {
        &self.spec
    }

    pub fn budget(&self) -> &ReductionBudget {
        &self.budget
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(state = ?phase, "control loop transition");
        #[cfg(test)]
        self.phases.push(phase);
        self.status.update(phase);
    }

    fn launch(&mut self) -> Result<S::Process, LaunchError> {
        let process = self.supervisor.start(&self.spec)?;
        self.status.set_process(
            self.supervisor.pid(&process),
            self.spec.hyperparameter(),
            self.spec.resume(),
        );
        Ok(process)
    }

    /// Drive the training process until it exits, is stopped, or the loop fails.
    pub async fn run(&mut self, shutdown: &mut ShutdownListener) -> Outcome {
        self.enter(Phase::Starting);

        let mut process = match self.launch() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "initial launch failed");
                self.enter(Phase::Failed);
                return Outcome::Failed(ControlError::Launch(e));
            }
        };
        // Whether `process` still needs to be stopped and reaped.
        let mut live = true;

        let mut state = LoopState::Running;
        loop {
            self.enter(state.phase());
            state = match state {
                LoopState::Running => self.check_process(&mut process, shutdown).await,
                LoopState::Evaluating => self.evaluate(),
                LoopState::Reducing => match self.restart(&mut process, shutdown).await {
                    Ok(Restart::Started(next)) => {
                        process = next;
                        LoopState::Running
                    }
                    Ok(Restart::Interrupted(code)) => LoopState::Exited {
                        reason: ExitReason::Interrupted,
                        code,
                    },
                    Err(e) => {
                        live = false;
                        LoopState::Failed(ControlError::Launch(e))
                    }
                },
                LoopState::Stopping(reason) => {
                    let code = self.stop_process(&mut process, shutdown).await;
                    LoopState::Exited { reason, code }
                }
                LoopState::Exited { reason, code } => {
                    tracing::info!(?reason, exit_code = code, "controller finished");
                    return Outcome::Exited { reason, code };
                }
                LoopState::Failed(error) => {
                    tracing::error!(error = %error, "controller failed");
                    if live {
                        self.stop_process(&mut process, shutdown).await;
                    }
                    return Outcome::Failed(error);
                }
            };
        }
    }

    /// Sleep one interval (cut short by a signal or the STOP file), then poll.
    async fn check_process(
        &mut self,
        process: &mut S::Process,
        shutdown: &mut ShutdownListener,
    ) -> LoopState {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.check_interval) => {}
            _ = shutdown.requested() => {}
        }

        if shutdown.is_requested() {
            tracing::info!("shutdown requested, stopping training");
            return LoopState::Stopping(ExitReason::Interrupted);
        }

        match self.supervisor.poll(process) {
            ProcessStatus::Running => LoopState::Evaluating,
            ProcessStatus::Exited(code) => {
                tracing::info!(exit_code = code, "training process exited on its own");
                let code = self.supervisor.wait(process).await;
                self.status.set_exited(code);
                LoopState::Exited {
                    reason: ExitReason::Completed,
                    code,
                }
            }
        }
    }

    fn evaluate(&mut self) -> LoopState {
        let series = match self.metrics.read() {
            Ok(MetricRead::Ready(series)) => series,
            Ok(MetricRead::NotReady(reason)) => {
                tracing::info!(%reason, "metrics not ready yet; waiting");
                return LoopState::Running;
            }
            Err(e) => return LoopState::Failed(ControlError::Metrics(e)),
        };

        let assessment = plateau::assess(
            &series,
            self.settings.min_epochs,
            self.settings.patience,
            self.settings.min_delta,
        );
        self.status
            .set_progress(assessment.epochs, assessment.best, &series.column);
        tracing::info!(
            column = %series.column,
            epochs = assessment.epochs,
            best = ?assessment.best,
            recent_tail = ?assessment.recent,
            "metric check"
        );

        if !assessment.plateau {
            return LoopState::Running;
        }

        let cooldown = self.settings.restart_cooldown_epochs;
        if let Some(at_restart) = self.epochs_at_restart.as_mut() {
            if assessment.epochs < *at_restart {
                tracing::debug!(
                    epochs = assessment.epochs,
                    at_restart = *at_restart,
                    "metric log shrank since restart, counting cooldown from its start"
                );
                *at_restart = 0;
            }
            let needed = *at_restart + cooldown;
            if cooldown > 0 && assessment.epochs < needed {
                tracing::debug!(
                    epochs = assessment.epochs,
                    needed,
                    "plateau ignored during restart cooldown"
                );
                return LoopState::Running;
            }
        }

        match self.budget.check() {
            ReductionDecision::Reduce { attempt } => {
                tracing::info!(
                    attempt,
                    max_reductions = self.budget.max_reductions(),
                    "plateau detected"
                );
                self.epochs_at_restart = Some(assessment.epochs);
                LoopState::Reducing
            }
            ReductionDecision::Exhausted => {
                tracing::info!(
                    max_reductions = self.budget.max_reductions(),
                    "plateau detected with reductions exhausted, stopping training"
                );
                LoopState::Stopping(ExitReason::BudgetExhausted)
            }
        }
    }

    /// Reduce the hyperparameter, stop the current process, and start a
    /// resumed one. The new process is never started before the old one exits.
    async fn restart(
        &mut self,
        process: &mut S::Process,
        shutdown: &mut ShutdownListener,
    ) -> Result<Restart<S::Process>, LaunchError> {
        let next = self
            .spec
            .reduced(self.settings.factor, self.settings.default_value);
        let used = self.budget.consume();
        self.status.set_reductions(used);
        tracing::info!(
            reduction = used,
            from = ?self.spec.hyperparameter(),
            to = ?next.hyperparameter(),
            "reducing hyperparameter, restarting with resume"
        );

        let code = self.stop_process(process, shutdown).await;
        self.spec = next;

        if shutdown.is_requested() {
            tracing::info!("shutdown requested during restart, not relaunching");
            return Ok(Restart::Interrupted(code));
        }

        self.launch().map(Restart::Started)
    }

    /// Graceful stop, escalating to a kill on grace timeout or a forced
    /// shutdown. Always reaps the process.
    async fn stop_process(
        &mut self,
        process: &mut S::Process,
        shutdown: &mut ShutdownListener,
    ) -> i32 {
        if shutdown.is_forced() {
            self.supervisor.force_stop(process);
        } else {
            self.supervisor.request_graceful_stop(process);
        }

        let grace = self.settings.grace_timeout;
        let exited = tokio::select! {
            code = self.supervisor.wait(process) => Some(code),
            _ = grace_elapsed(grace) => {
                tracing::warn!(timeout_secs = ?grace.map(|g| g.as_secs()), "training process ignored graceful stop, killing");
                None
            }
            _ = shutdown.reached(ShutdownLevel::Force) => {
                tracing::warn!("forced shutdown, killing training process");
                None
            }
        };

        let code = match exited {
            Some(code) => code,
            None => {
                self.supervisor.force_stop(process);
                self.supervisor.wait(process).await
            }
        };
        self.status.set_exited(code);
        code
    }
}

async fn grace_elapsed(grace: Option<Duration>) {
    match grace {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
