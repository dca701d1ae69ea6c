// Signal handling for running as PID 1 in a container
// First SIGINT/SIGTERM drains gracefully, a second one exits immediately.

use std::future::{pending, Future};

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownState {
    #[default]
    Running,
    ShuttingDown,
    ForceExit,
}

/// What the process does in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop accepting connections and let in-flight requests finish.
    BeginGracefulShutdown,
    /// Exit now with a non-zero status.
    ExitImmediately,
}

impl ShutdownState {
    pub fn on_signal(&mut self) -> SignalAction {
        match self {
            ShutdownState::Running => {
                *self = ShutdownState::ShuttingDown;
                SignalAction::BeginGracefulShutdown
            }
            ShutdownState::ShuttingDown | ShutdownState::ForceExit => {
                *self = ShutdownState::ForceExit;
                SignalAction::ExitImmediately
            }
        }
    }
}

/// Spawns the signal watcher and returns a future that resolves when the
/// server should stop accepting connections. Pass it to
/// `with_graceful_shutdown`.
pub fn install() -> impl Future<Output = ()> + Send + 'static {
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut state = ShutdownState::default();
        let mut graceful = Some(tx);

        loop {
            let signal = wait_for_signal().await;
            match state.on_signal() {
                SignalAction::BeginGracefulShutdown => {
                    tracing::info!(signal, "shutting down gracefully, signal again to force exit");
                    if let Some(tx) = graceful.take() {
                        let _ = tx.send(());
                    }
                }
                SignalAction::ExitImmediately => {
                    tracing::warn!(signal, "second signal, exiting immediately");
                    std::process::exit(1);
                }
            }
        }
    });

    async move {
        let _ = rx.await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).ok();

    tokio::select! {
        _ = ctrl_c() => "SIGINT",
        _ = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => pending::<()>().await,
            }
        } => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await;
    "ctrl_c"
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        pending::<()>().await;
    }
}
