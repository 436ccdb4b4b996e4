//! Process-level stop triggers: termination signals and panics.
//!
//! Every trigger funnels into one [`StopSignals::wait`] so the binary runs the
//! same graceful shutdown (and advertisement withdrawal) whichever fires.

use std::io;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal(&'static str),
    /// A thread panicked; tokio keeps the process alive after a task panic.
    Panic,
}

/// Chains a hook after the current panic hook that flips the returned watch.
pub fn install_panic_trigger() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        tx.send_replace(true);
    }));
    rx
}

pub struct StopSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
    #[cfg(windows)]
    ctrl_close: tokio::signal::windows::CtrlClose,
    panicked: watch::Receiver<bool>,
}

impl StopSignals {
    /// Registers the signal handlers now, so a signal arriving before
    /// [`StopSignals::wait`] is polled is not lost. Needs a tokio runtime.
    #[cfg(unix)]
    pub fn install(panicked: watch::Receiver<bool>) -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            panicked,
        })
    }

    #[cfg(windows)]
    pub fn install(panicked: watch::Receiver<bool>) -> io::Result<Self> {
        use tokio::signal::windows::{ctrl_c, ctrl_close};

        Ok(Self {
            ctrl_c: ctrl_c()?,
            ctrl_close: ctrl_close()?,
            panicked,
        })
    }

    #[cfg(unix)]
    pub async fn wait(mut self) -> StopReason {
        tokio::select! {
            _ = self.terminate.recv() => StopReason::Signal("SIGTERM"),
            _ = self.interrupt.recv() => StopReason::Signal("SIGINT"),
            _ = self.hangup.recv() => StopReason::Signal("SIGHUP"),
            _ = wait_panicked(&mut self.panicked) => StopReason::Panic,
        }
    }

    #[cfg(windows)]
    pub async fn wait(mut self) -> StopReason {
        tokio::select! {
            _ = self.ctrl_c.recv() => StopReason::Signal("CTRL_C"),
            _ = self.ctrl_close.recv() => StopReason::Signal("CTRL_CLOSE"),
            _ = wait_panicked(&mut self.panicked) => StopReason::Panic,
        }
    }
}

async fn wait_panicked(panicked: &mut watch::Receiver<bool>) {
    if panicked.wait_for(|flag| *flag).await.is_err() {
        debug!("panic trigger gone; waiting on signals only");
        std::future::pending::<()>().await;
    }
}
