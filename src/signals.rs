//! Termination signal handling.
//!
//! Once CMUX is up the daemon has nothing to do but keep the line discipline
//! attached. It parks on `TerminationSignals::wait` until one of the
//! termination signals arrives, then returns to the caller so the teardown
//! runs in the normal flow of execution rather than in signal context.

use futures::future::select_all;
use log::{debug, info};
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::Result;

/// Signals that end the daemon.
const TERMINATION_SIGNALS: [(&str, libc::c_int); 5] = [
    ("SIGINT", libc::SIGINT),
    ("SIGTERM", libc::SIGTERM),
    ("SIGHUP", libc::SIGHUP),
    ("SIGPIPE", libc::SIGPIPE),
    ("SIGUSR1", libc::SIGUSR1),
];

pub struct TerminationSignals {
    listeners: Vec<(&'static str, Signal)>,
}

impl TerminationSignals {
    /// Registers listeners for all termination signals. From here on these
    /// signals no longer kill the process.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be registered.
    pub fn install() -> Result<Self> {
        let mut listeners = Vec::with_capacity(TERMINATION_SIGNALS.len());
        for (name, signum) in TERMINATION_SIGNALS {
            listeners.push((name, signal(SignalKind::from_raw(signum))?));
        }

        // SIGKILL cannot be caught, the registration is refused
        if let Err(e) = signal(SignalKind::from_raw(libc::SIGKILL)) {
            debug!("SIGKILL not trapped: {}", e);
        }

        Ok(Self { listeners })
    }

    /// Waits for the first termination signal and returns its name.
    pub async fn wait(&mut self) -> &'static str {
        let pending = self.listeners.iter_mut().map(|(name, listener)| {
            let name = *name;
            Box::pin(async move {
                listener.recv().await;
                name
            })
        });

        let (name, _, _) = select_all(pending).await;
        info!("cmux received signal: {}", name);
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn test_wait_returns_on_signal() {
        init_logger();
        let mut signals = TerminationSignals::install().unwrap();

        unsafe {
            libc::raise(libc::SIGUSR1);
        }

        let name = tokio::time::timeout(Duration::from_secs(5), signals.wait())
            .await
            .unwrap();
        assert_eq!(name, "SIGUSR1");
    }

    #[tokio::test]
    async fn test_install_survives_refused_sigkill() {
        init_logger();
        let signals = TerminationSignals::install().unwrap();

        let names: Vec<_> =
            signals.listeners.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            ["SIGINT", "SIGTERM", "SIGHUP", "SIGPIPE", "SIGUSR1"]
        );
    }
}
