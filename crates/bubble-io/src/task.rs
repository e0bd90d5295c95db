use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Periodic tasks owned by one subsystem, stopped together.
pub(crate) struct TaskSet {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub(crate) fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    /// Signals every task and waits for all of them to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(subsystem = self.name, error = %e, "Task ended abnormally");
            }
        }
    }
}

/// Resolves once shutdown has been requested or the owner is gone.
pub(crate) async fn stopped(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}
