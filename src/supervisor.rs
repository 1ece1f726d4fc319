/// Training process lifecycle: spawn in its own process group, poll,
/// interrupt gracefully (falling back to a kill), and wait for exit.
use crate::command::TrainingRunSpec;
use crate::config::ShutdownConfig;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

/// Exit code reported when the real status could not be collected.
const UNKNOWN_EXIT_CODE: i32 = 1;

/// Non-blocking view of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

/// The training process could not be launched.
#[derive(Debug)]
pub enum LaunchError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to launch training process `{}`: {}", command, source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Starts, polls, stops and reaps the monitored process.
///
/// Every successful `start` must be matched by a `wait`.
pub trait ProcessSupervisor {
    type Process;

    fn start(&mut self, spec: &TrainingRunSpec) -> Result<Self::Process, LaunchError>;

    /// OS pid, for status reporting.
    fn pid(&self, process: &Self::Process) -> Option<u32>;

    fn poll(&mut self, process: &mut Self::Process) -> ProcessStatus;

    /// Ask the process to save state and exit. Falls back to `force_stop`
    /// when the interrupt cannot be delivered; never fails.
    fn request_graceful_stop(&mut self, process: &mut Self::Process);

    /// Kill the process (and its group). Best effort; never fails.
    fn force_stop(&mut self, process: &mut Self::Process);

    /// Resolve with the exit code once the process has exited.
    fn wait(&mut self, process: &mut Self::Process) -> impl Future<Output = i32>;
}

/// A spawned training process.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    command_line: String,
}

/// How a graceful stop is attempted on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    /// Send a signal to the whole process group.
    #[cfg(unix)]
    ProcessGroupSignal(nix::sys::signal::Signal),
    /// Send CTRL_BREAK to the child's console process group.
    #[cfg(windows)]
    ConsoleBreak,
    /// No soft interrupt; every stop is a kill.
    Terminate,
}

impl StopStrategy {
    /// Pick the strategy for the current platform and configuration.
    pub fn for_host(config: &ShutdownConfig) -> Self {
        if !config.graceful {
            return StopStrategy::Terminate;
        }

        #[cfg(unix)]
        {
            match config.graceful_signal.parse::<nix::sys::signal::Signal>() {
                Ok(signal) => StopStrategy::ProcessGroupSignal(signal),
                Err(e) => {
                    tracing::warn!(
                        signal = %config.graceful_signal,
                        error = %e,
                        "unknown graceful signal, using SIGTERM"
                    );
                    StopStrategy::ProcessGroupSignal(nix::sys::signal::Signal::SIGTERM)
                }
            }
        }

        #[cfg(windows)]
        {
            StopStrategy::ConsoleBreak
        }

        #[cfg(not(any(unix, windows)))]
        {
            StopStrategy::Terminate
        }
    }
}

/// Supervisor for real OS processes.
#[derive(Debug, Clone)]
pub struct OsSupervisor {
    strategy: StopStrategy,
}

impl OsSupervisor {
    pub fn new(strategy: StopStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> StopStrategy {
        self.strategy
    }
}

/// Build the command, through the platform shell when requested.
fn build_command(spec: &TrainingRunSpec) -> (Command, String) {
    let rendered = spec.render();
    let line = rendered.command_line();

    let cmd = if spec.template().shell {
        shell_command(&line)
    } else {
        let mut cmd = Command::new(&rendered.program);
        cmd.args(&rendered.args);
        cmd
    };

    (cmd, line)
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("powershell");
    cmd.arg("-Command").arg(line);
    cmd
}

/// Put the child in its own process group so it can be signalled as a whole
/// and does not receive the terminal's Ctrl-C directly.
fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Exit code for `status`; death by signal `n` maps to `128 + n`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::unistd::Pid;

    // pid 0 would address our own process group
    if pid == 0 {
        return Err(nix::errno::Errno::ESRCH);
    }
    nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal)
}

#[cfg(windows)]
fn send_console_break(pid: u32) -> std::io::Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    // group 0 is every process on our console, including us
    if pid == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
    }
    // SAFETY: no pointer arguments; an unknown group id only makes the call fail.
    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl ProcessSupervisor for OsSupervisor {
    type Process = SupervisedProcess;

    fn start(&mut self, spec: &TrainingRunSpec) -> Result<SupervisedProcess, LaunchError> {
        let (mut cmd, line) = build_command(spec);
        isolate_process_group(&mut cmd);
        cmd.stdin(Stdio::null());

        tracing::info!(
            command = %line,
            hyperparameter = ?spec.hyperparameter(),
            resume = spec.resume(),
            "spawning training process"
        );

        let child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            command: line.clone(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "training process started");

        Ok(SupervisedProcess {
            child,
            pid,
            started_at: Utc::now(),
            command_line: line,
        })
    }

    fn pid(&self, process: &SupervisedProcess) -> Option<u32> {
        (process.pid != 0).then_some(process.pid)
    }

    fn poll(&mut self, process: &mut SupervisedProcess) -> ProcessStatus {
        match process.child.try_wait() {
            Ok(Some(status)) => ProcessStatus::Exited(exit_code(status)),
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                tracing::warn!(pid = process.pid, error = %e, "failed to poll training process");
                ProcessStatus::Running
            }
        }
    }

    fn request_graceful_stop(&mut self, process: &mut SupervisedProcess) {
        match self.strategy {
            #[cfg(unix)]
            StopStrategy::ProcessGroupSignal(signal) => match signal_group(process.pid, signal) {
                Ok(()) => {
                    tracing::info!(pid = process.pid, signal = signal.as_str(), "sent graceful stop to process group");
                }
                Err(e) => {
                    tracing::warn!(
                        pid = process.pid,
                        signal = signal.as_str(),
                        error = %e,
                        "degraded shutdown: graceful signal failed, killing process group"
                    );
                    self.force_stop(process);
                }
            },
            #[cfg(windows)]
            StopStrategy::ConsoleBreak => match send_console_break(process.pid) {
                Ok(()) => {
                    tracing::info!(pid = process.pid, "sent CTRL_BREAK to process group");
                }
                Err(e) => {
                    tracing::warn!(
                        pid = process.pid,
                        error = %e,
                        "degraded shutdown: CTRL_BREAK failed, killing process"
                    );
                    self.force_stop(process);
                }
            },
            StopStrategy::Terminate => {
                tracing::warn!(
                    pid = process.pid,
                    "degraded shutdown: no graceful interrupt available, killing process"
                );
                self.force_stop(process);
            }
        }
    }

    fn force_stop(&mut self, process: &mut SupervisedProcess) {
        #[cfg(unix)]
        {
            match signal_group(process.pid, nix::sys::signal::Signal::SIGKILL) {
                Ok(()) => {
                    tracing::info!(pid = process.pid, "killed process group");
                    return;
                }
                Err(e) => {
                    tracing::debug!(pid = process.pid, error = %e, "killpg failed, killing child directly");
                }
            }
        }

        if let Err(e) = process.child.start_kill() {
            tracing::debug!(pid = process.pid, error = %e, "kill failed, process likely already exited");
        }
    }

    async fn wait(&mut self, process: &mut SupervisedProcess) -> i32 {
        match process.child.wait().await {
            Ok(status) => {
                let code = exit_code(status);
                tracing::info!(
                    pid = process.pid,
                    command = %process.command_line,
                    exit_code = code,
                    runtime_secs = (Utc::now() - process.started_at).num_seconds(),
                    "training process exited"
                );
                code
            }
            Err(e) => {
                tracing::warn!(pid = process.pid, error = %e, "failed to wait for training process");
                UNKNOWN_EXIT_CODE
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::CommandTemplate;
    use nix::sys::signal::Signal;
    use std::time::Duration;

    fn spec(command: &str, args: &[&str]) -> TrainingRunSpec {
        TrainingRunSpec::initial(
            CommandTemplate {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                shell: false,
                hyperparameter_arg: "lr0={value}".to_string(),
                resume_arg: "resume=True".to_string(),
            },
            None,
        )
    }

    fn sigterm_supervisor() -> OsSupervisor {
        OsSupervisor::new(StopStrategy::ProcessGroupSignal(Signal::SIGTERM))
    }

    #[test]
    fn test_strategy_from_config() {
        let mut config = ShutdownConfig::default();
        assert_eq!(
            StopStrategy::for_host(&config),
            StopStrategy::ProcessGroupSignal(Signal::SIGTERM)
        );
        config.graceful_signal = "SIGINT".to_string();
        assert_eq!(
            StopStrategy::for_host(&config),
            StopStrategy::ProcessGroupSignal(Signal::SIGINT)
        );
        config.graceful = false;
        assert_eq!(StopStrategy::for_host(&config), StopStrategy::Terminate);
    }

    #[tokio::test]
    async fn test_start_and_wait_success() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("true", &[])).unwrap();
        assert!(sup.pid(&proc).is_some());
        assert_eq!(sup.wait(&mut proc).await, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_relayed() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("sh", &["-c", "exit 3"])).unwrap();
        assert_eq!(sup.wait(&mut proc).await, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let mut sup = sigterm_supervisor();
        let err = sup
            .start(&spec("nonexistent-binary-xyz", &[]))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_shell_mode_runs_through_sh() {
        let mut sup = sigterm_supervisor();
        let s = CommandTemplate {
            command: "exit".to_string(),
            args: vec!["5".to_string()],
            shell: true,
            hyperparameter_arg: "{value}".to_string(),
            resume_arg: String::new(),
        };
        let mut proc = sup.start(&TrainingRunSpec::initial(s, None)).unwrap();
        assert_eq!(proc.command_line, "exit 5");
        assert_eq!(sup.wait(&mut proc).await, 5);
    }

    #[tokio::test]
    async fn test_poll_reports_running_then_exited() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("sleep", &["0.2"])).unwrap();
        assert_eq!(sup.poll(&mut proc), ProcessStatus::Running);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sup.poll(&mut proc), ProcessStatus::Exited(0));
        assert_eq!(sup.wait(&mut proc).await, 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_reaches_process_group() {
        let mut sup = sigterm_supervisor();
        let script = "trap 'exit 7' TERM; while true; do sleep 0.05; done";
        let mut proc = sup.start(&spec("sh", &["-c", script])).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.request_graceful_stop(&mut proc);
        let code = tokio::time::timeout(Duration::from_secs(5), sup.wait(&mut proc))
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_graceful_stop_of_plain_process() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("sleep", &["30"])).unwrap();
        sup.request_graceful_stop(&mut proc);
        let code = tokio::time::timeout(Duration::from_secs(5), sup.wait(&mut proc))
            .await
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn test_terminate_strategy_kills() {
        let mut sup = OsSupervisor::new(StopStrategy::Terminate);
        let mut proc = sup.start(&spec("sleep", &["30"])).unwrap();
        sup.request_graceful_stop(&mut proc);
        let code = tokio::time::timeout(Duration::from_secs(5), sup.wait(&mut proc))
            .await
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[tokio::test]
    async fn test_undeliverable_signal_falls_back_to_kill() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("sleep", &["30"])).unwrap();
        // killpg refuses pid 0, so both group signals fail and the direct
        // child kill is the only thing that can end the process
        proc.pid = 0;
        sup.request_graceful_stop(&mut proc);
        let code = tokio::time::timeout(Duration::from_secs(5), sup.wait(&mut proc))
            .await
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[test]
    fn test_signal_group_rejects_pid_zero() {
        assert_eq!(
            signal_group(0, Signal::SIGTERM),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn test_force_stop_after_ignored_interrupt() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup
            .start(&spec("sh", &["-c", "trap '' TERM; sleep 30"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.request_graceful_stop(&mut proc);

        let early = tokio::time::timeout(Duration::from_millis(300), sup.wait(&mut proc)).await;
        assert!(early.is_err(), "process should ignore SIGTERM");

        sup.force_stop(&mut proc);
        let code = tokio::time::timeout(Duration::from_secs(5), sup.wait(&mut proc))
            .await
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[tokio::test]
    async fn test_stop_after_exit_does_not_panic() {
        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&spec("true", &[])).unwrap();
        assert_eq!(sup.wait(&mut proc).await, 0);
        sup.request_graceful_stop(&mut proc);
        sup.force_stop(&mut proc);
        assert_eq!(sup.wait(&mut proc).await, 0);
    }

    #[tokio::test]
    async fn test_rendered_arguments_reach_process() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("echo \"$@\" > {}", out.display());
        let s = TrainingRunSpec::initial(
            CommandTemplate {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script, "train".to_string()],
                shell: false,
                hyperparameter_arg: "lr0={value}".to_string(),
                resume_arg: "resume=True".to_string(),
            },
            Some(0.01),
        )
        .reduced(0.5, 0.01);

        let mut sup = sigterm_supervisor();
        let mut proc = sup.start(&s).unwrap();
        assert_eq!(sup.wait(&mut proc).await, 0);
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "lr0=0.005 resume=True");
    }
}
