use tokio::sync::watch;
use tracing::info;

/// Sender half, held by whoever decides to stop (e.g. the signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        info!("Requesting shutdown...");
        self.tx.send_replace(true);
    }
}

/// Receiver half, polled by the trading loop between state transitions.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// A signal that never fires. Used by backtests.
    pub fn never() -> Shutdown {
        Self::new().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the handle is gone.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
