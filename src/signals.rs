/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// First SIGINT: stop the training process gracefully, then exit.
/// Second SIGINT (within the force window): kill the training process group.
/// SIGTERM: same as a single SIGINT.
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const STOP_FILE_POLL: Duration = Duration::from_millis(500);

/// How urgently the operator wants the controller to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownLevel {
    None,
    Graceful,
    Force,
}

/// Sending side of the shutdown channel.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<ShutdownLevel>,
}

impl ShutdownTrigger {
    /// Raise the shutdown level. Never lowers it.
    pub fn request(&self, level: ShutdownLevel) {
        self.tx.send_if_modified(|current| {
            if level > *current {
                *current = level;
                true
            } else {
                false
            }
        });
    }
}

/// Receiving side, held by the control loop.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownLevel>,
    stop_file: Option<PathBuf>,
}

impl ShutdownListener {
    pub fn level(&self) -> ShutdownLevel {
        *self.rx.borrow()
    }

    /// True when a signal asked for shutdown or the STOP file exists.
    pub fn is_requested(&self) -> bool {
        self.level() >= ShutdownLevel::Graceful || self.stop_file_present()
    }

    pub fn is_forced(&self) -> bool {
        self.level() >= ShutdownLevel::Force
    }

    fn stop_file_present(&self) -> bool {
        self.stop_file.as_deref().is_some_and(Path::exists)
    }

    /// Resolve once a signal or the STOP file asks for shutdown. The STOP file
    /// is polled twice a second.
    pub async fn requested(&mut self) {
        let stop_file = self.stop_file.clone();
        tokio::select! {
            _ = self.reached(ShutdownLevel::Graceful) => {}
            _ = stop_file_created(stop_file) => {}
        }
    }

    /// Resolve once the shutdown level reaches `level`. Pends forever if the
    /// trigger side is gone.
    pub async fn reached(&mut self, level: ShutdownLevel) {
        let result = self.rx.wait_for(|current| *current >= level).await.map(|_| ());
        if result.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn stop_file_created(path: Option<PathBuf>) {
    let Some(path) = path else {
        return std::future::pending().await;
    };
    let mut ticker = tokio::time::interval(STOP_FILE_POLL);
    loop {
        ticker.tick().await;
        if path.exists() {
            return;
        }
    }
}

/// A connected trigger/listener pair with no OS signal wiring.
pub fn channel(stop_file: Option<PathBuf>) -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(ShutdownLevel::None);
    (ShutdownTrigger { tx }, ShutdownListener { rx, stop_file })
}

enum Received {
    Interrupt,
    Terminate,
    Closed,
}

/// Spawn a task translating SIGINT/SIGTERM into shutdown requests and return
/// the listener. Must be called inside a tokio runtime.
pub fn install(
    stop_file: Option<PathBuf>,
    force_window: Duration,
) -> std::io::Result<ShutdownListener> {
    let (trigger, listener) = channel(stop_file);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        let mut last_interrupt: Option<Instant> = None;
        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                r = tokio::signal::ctrl_c() => match r {
                    Ok(()) => Received::Interrupt,
                    Err(_) => Received::Closed,
                },
                r = sigterm.recv() => match r {
                    Some(()) => Received::Terminate,
                    None => Received::Closed,
                },
            };
            #[cfg(not(unix))]
            let received = match tokio::signal::ctrl_c().await {
                Ok(()) => Received::Interrupt,
                Err(_) => Received::Closed,
            };

            match received {
                Received::Interrupt => {
                    let now = Instant::now();
                    let level = interrupt_level(last_interrupt, now, force_window);
                    last_interrupt = Some(now);
                    if level == ShutdownLevel::Force {
                        tracing::warn!("second interrupt, killing training process");
                    } else {
                        tracing::info!(
                            window_secs = force_window.as_secs(),
                            "interrupt received, stopping training gracefully (interrupt again to kill)"
                        );
                    }
                    trigger.request(level);
                }
                Received::Terminate => {
                    tracing::info!("SIGTERM received, stopping training gracefully");
                    trigger.request(ShutdownLevel::Graceful);
                }
                Received::Closed => {
                    tracing::warn!("signal listener closed, operator interrupts will be ignored");
                    return;
                }
            }
        }
    });

    Ok(listener)
}

/// Level for an interrupt arriving at `now`, given the previous one.
fn interrupt_level(previous: Option<Instant>, now: Instant, window: Duration) -> ShutdownLevel {
    match previous {
        Some(prev) if now.duration_since(prev) <= window => ShutdownLevel::Force,
        _ => ShutdownLevel::Graceful,
    }
}
